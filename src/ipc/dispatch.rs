use log::{debug, error, info};

use crate::actions::{Button, PointerSink};
use crate::engine::Effect;
use crate::gestures::Gesture;
use crate::tracker::CursorTarget;

pub fn button_for(gesture: Gesture) -> Button {
    match gesture {
        Gesture::Blink => Button::Right,
        Gesture::MouthOpen => Button::Left,
    }
}

/// Pushes frame effects into a sink. Clicks share one global cooldown on
/// top of the per-gesture ones.
#[derive(Debug)]
pub struct Dispatcher {
    click_cooldown: f64,
    last_click: Option<f64>,
    last_target: Option<CursorTarget>,
}

impl Dispatcher {
    pub fn new(click_cooldown: f64) -> Self {
        Self {
            click_cooldown,
            last_click: None,
            last_target: None,
        }
    }

    /// Returns the clicks actually emitted.
    pub fn dispatch(
        &mut self,
        effects: &[Effect],
        now: f64,
        sink: &mut dyn PointerSink,
    ) -> Vec<Button> {
        let mut clicked = Vec::new();
        for effect in effects {
            match effect {
                Effect::MoveCursor(target) => {
                    if self.last_target == Some(*target) {
                        continue;
                    }
                    match sink.move_to(target.x, target.y) {
                        Ok(()) => self.last_target = Some(*target),
                        Err(e) => error!("cursor move failed: {e}"),
                    }
                }
                Effect::Gesture(g) => {
                    let button = button_for(*g);
                    if !self.click_allowed(now) {
                        debug!("{g:?} ignored: click cooldown");
                        continue;
                    }
                    match sink.click(button) {
                        Ok(()) => {
                            info!("{g:?} -> {button:?} click");
                            self.last_click = Some(now);
                            clicked.push(button);
                        }
                        Err(e) => error!("{button:?} click failed: {e}"),
                    }
                }
            }
        }
        clicked
    }

    fn click_allowed(&self, now: f64) -> bool {
        self.last_click
            .is_none_or(|t| now - t >= self.click_cooldown)
    }
}
