use anyhow::{Result, anyhow};
use log::{debug, info, warn};
use serde::Serialize;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Button {
    Left,
    Right,
}

impl FromStr for Button {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "left" => Ok(Button::Left),
            "right" => Ok(Button::Right),
            other => Err(anyhow!("unknown mouse button: {other}")),
        }
    }
}

/// Where cursor targets and clicks end up.
pub trait PointerSink {
    /// Move the pointer to absolute screen coordinates.
    fn move_to(&mut self, x: i32, y: i32) -> Result<()>;
    fn click(&mut self, button: Button) -> Result<()>;
}

/// Virtual relative pointer. The kernel only accepts deltas, so the sink
/// keeps its own idea of where the pointer is and sends the difference.
/// The first move homes the pointer into the top-left corner.
pub struct UinputSink {
    position: Option<(i32, i32)>,
    #[allow(dead_code)]
    linux: Option<Box<LinuxUinput>>,
}

// Larger than any screen; one push pins the pointer at (0, 0).
const HOME_SWEEP: i32 = 1 << 15;

impl UinputSink {
    pub fn new() -> Result<Self> {
        #[cfg(target_os = "linux")]
        {
            let dev = LinuxUinput::create()?;
            return Ok(Self {
                position: None,
                linux: Some(Box::new(dev)),
            });
        }
        #[allow(unreachable_code)]
        {
            warn!("uinput not available; running in NO-OP mode");
            Ok(Self::noop())
        }
    }

    pub fn noop() -> Self {
        Self {
            position: None,
            linux: None,
        }
    }

    #[allow(unused_variables)]
    fn relative(&mut self, dx: i32, dy: i32) -> Result<()> {
        #[cfg(target_os = "linux")]
        if let Some(dev) = self.linux.as_mut() {
            dev.move_by(dx, dy)?;
        }
        Ok(())
    }
}

impl PointerSink for UinputSink {
    fn move_to(&mut self, x: i32, y: i32) -> Result<()> {
        let (px, py) = match self.position {
            Some(p) => p,
            None => {
                debug!("uinput: homing pointer");
                self.relative(-HOME_SWEEP, -HOME_SWEEP)?;
                (0, 0)
            }
        };
        let (dx, dy) = (x - px, y - py);
        if dx != 0 || dy != 0 {
            self.relative(dx, dy)?;
        }
        self.position = Some((x, y));
        Ok(())
    }

    #[allow(unused_variables)]
    fn click(&mut self, button: Button) -> Result<()> {
        #[cfg(target_os = "linux")]
        if let Some(dev) = self.linux.as_mut() {
            dev.click(button)?;
        }
        Ok(())
    }
}

#[cfg(target_os = "linux")]
struct LinuxUinput {
    dev: uinput::device::Device,
}

#[cfg(target_os = "linux")]
impl LinuxUinput {
    fn create() -> Result<Self> {
        use uinput::event::{controller::Mouse, relative};

        let dev = uinput::default()?
            .name("facectl virtual pointer")?
            .event(relative::Position::X)?
            .event(relative::Position::Y)?
            .event(Mouse::Left)?
            .event(Mouse::Right)?
            .create()?;

        info!("uinput: created virtual pointer");
        Ok(Self { dev })
    }

    fn sync(&mut self) -> Result<()> {
        self.dev.synchronize()?;
        Ok(())
    }

    fn move_by(&mut self, dx: i32, dy: i32) -> Result<()> {
        use uinput::event::relative::Position;
        self.dev.send(Position::X, dx)?;
        self.dev.send(Position::Y, dy)?;
        self.sync()
    }

    fn click(&mut self, button: Button) -> Result<()> {
        use uinput::event::controller::Mouse;
        let key = match button {
            Button::Left => Mouse::Left,
            Button::Right => Mouse::Right,
        };
        self.dev.send(key, 1)?;
        self.sync()?;
        self.dev.send(key, 0)?;
        self.sync()
    }
}

#[cfg(test)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkEvent {
    Move(i32, i32),
    Click(Button),
}

/// Collects everything it is asked to do.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub events: Vec<SinkEvent>,
}

#[cfg(test)]
impl PointerSink for RecordingSink {
    fn move_to(&mut self, x: i32, y: i32) -> Result<()> {
        self.events.push(SinkEvent::Move(x, y));
        Ok(())
    }

    fn click(&mut self, button: Button) -> Result<()> {
        self.events.push(SinkEvent::Click(button));
        Ok(())
    }
}
