//! The frame loop thread. It owns the [`Engine`] and the pointer sink;
//! everyone else talks to it through [`ControlMsg`]s, which are drained
//! at every frame boundary and on an idle tick.

use log::{debug, info, warn};
use serde_json::json;
use std::{
    sync::mpsc::{Receiver, RecvTimeoutError, Sender, TryRecvError, channel},
    thread,
    time::{Duration, Instant},
};

use super::dispatch::Dispatcher;
use crate::actions::{Button, PointerSink};
use crate::engine::{Command, Engine, FrameOutcome, Notification, Status};
use crate::landmarks::Frame;

const IDLE_TICK: Duration = Duration::from_millis(50);

pub enum ControlMsg {
    Command(Command, Option<Sender<Status>>),
    Status(Sender<Status>),
    Shutdown,
}

/// Everything the pipeline reports back to the daemon loop.
#[derive(Debug, Clone, PartialEq)]
pub enum DaemonEvent {
    Engine(Notification),
    Click(Button),
    SourceClosed,
}

impl DaemonEvent {
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            DaemonEvent::Engine(n) => serde_json::to_value(n).unwrap_or(serde_json::Value::Null),
            DaemonEvent::Click(b) => json!({"event": "click", "button": b}),
            DaemonEvent::SourceClosed => json!({"event": "source_closed"}),
        }
    }
}

pub struct Pipeline {
    engine: Engine,
    dispatcher: Dispatcher,
    sink: Box<dyn PointerSink + Send>,
    events: Sender<DaemonEvent>,
    clock: Instant,
}

pub struct PipelineHandle {
    pub control: Sender<ControlMsg>,
    thread: thread::JoinHandle<()>,
}

impl PipelineHandle {
    pub fn shutdown(self) {
        let _ = self.control.send(ControlMsg::Shutdown);
        if self.thread.join().is_err() {
            warn!("pipeline thread panicked");
        }
    }
}

impl Pipeline {
    pub fn new(
        engine: Engine,
        click_cooldown: f64,
        sink: Box<dyn PointerSink + Send>,
        events: Sender<DaemonEvent>,
    ) -> Self {
        Self {
            engine,
            dispatcher: Dispatcher::new(click_cooldown),
            sink,
            events,
            clock: Instant::now(),
        }
    }

    pub fn spawn(self, frames: Receiver<Frame>) -> PipelineHandle {
        let (control, rx) = channel();
        let thread = thread::spawn(move || self.run(frames, rx));
        PipelineHandle { control, thread }
    }

    fn run(mut self, frames: Receiver<Frame>, control: Receiver<ControlMsg>) {
        let mut frames = Some(frames);
        info!("pipeline: running (state {:?})", self.engine.state());
        loop {
            if !self.drain(&control) {
                break;
            }
            let Some(rx) = frames.as_ref() else {
                // source is gone; only commands remain
                match control.recv() {
                    Ok(msg) => {
                        if !self.handle_control(msg) {
                            break;
                        }
                    }
                    Err(_) => break,
                }
                continue;
            };
            match rx.recv_timeout(IDLE_TICK) {
                Ok(frame) => self.handle_frame(&frame),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    info!("pipeline: frame source closed");
                    self.emit(DaemonEvent::SourceClosed);
                    frames = None;
                }
            }
        }
        info!("pipeline: stopped");
    }

    /// Apply every queued message. `false` once a shutdown was seen.
    fn drain(&mut self, control: &Receiver<ControlMsg>) -> bool {
        loop {
            match control.try_recv() {
                Ok(msg) => {
                    if !self.handle_control(msg) {
                        return false;
                    }
                }
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => return false,
            }
        }
    }

    pub fn handle_control(&mut self, msg: ControlMsg) -> bool {
        match msg {
            ControlMsg::Command(cmd, reply) => {
                debug!("pipeline: {cmd:?}");
                for n in self.engine.apply(cmd) {
                    self.emit(DaemonEvent::Engine(n));
                }
                if let Some(reply) = reply {
                    let _ = reply.send(self.engine.status());
                }
                true
            }
            ControlMsg::Status(reply) => {
                let _ = reply.send(self.engine.status());
                true
            }
            ControlMsg::Shutdown => false,
        }
    }

    pub fn handle_frame(&mut self, frame: &Frame) {
        let ts = frame
            .timestamp
            .unwrap_or_else(|| self.clock.elapsed().as_secs_f64());
        let report = self.engine.process(frame, ts);
        if let FrameOutcome::Calibrating { progress } = report.outcome {
            debug!("pipeline: calibrating {progress:.0}%");
        }
        let clicks = self
            .dispatcher
            .dispatch(&report.effects, ts, self.sink.as_mut());
        for n in report.notifications {
            self.emit(DaemonEvent::Engine(n));
        }
        for b in clicks {
            self.emit(DaemonEvent::Click(b));
        }
    }

    fn emit(&self, evt: DaemonEvent) {
        let _ = self.events.send(evt);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{RecordingSink, SinkEvent};
    use crate::config::Tuning;
    use crate::landmarks::{
        Point2,
        testing::{face_at, face_with},
    };
    use crate::profile::Profile;
    use crate::tracker::TrackingState;
    use std::sync::{Arc, Mutex};

    // The pipeline wants an owned `Send` sink; share the recording.
    #[derive(Clone, Default)]
    struct Shared(Arc<Mutex<RecordingSink>>);

    impl PointerSink for Shared {
        fn move_to(&mut self, x: i32, y: i32) -> anyhow::Result<()> {
            self.0.lock().unwrap().move_to(x, y)
        }
        fn click(&mut self, b: Button) -> anyhow::Result<()> {
            self.0.lock().unwrap().click(b)
        }
    }

    fn pipeline() -> (Pipeline, Shared, Receiver<DaemonEvent>) {
        let mut tuning = Tuning::default();
        tuning.pipeline.process_every_n_frames = 1;
        let engine = Engine::new(tuning, Profile::new("test"));
        let sink = Shared::default();
        let (tx, rx) = channel();
        (
            Pipeline::new(engine, 0.5, Box::new(sink.clone()), tx),
            sink,
            rx,
        )
    }

    fn frame(t: f64, nose: Point2) -> Frame {
        Frame::with_face(Some(t), face_at(nose))
    }

    #[test]
    fn commands_and_frames_drive_the_sink() {
        let (mut p, sink, events) = pipeline();
        assert!(p.handle_control(ControlMsg::Command(Command::Start, None)));
        for i in 0..15 {
            p.handle_frame(&frame(i as f64 * 0.03125, Point2::new(100.0, 100.0)));
        }
        assert_eq!(p.engine.state(), TrackingState::Tracking);

        p.handle_frame(&frame(0.5, Point2::new(110.0, 100.0)));
        let closed = face_with(Point2::new(110.0, 100.0), 0.1, 0.1);
        p.handle_frame(&Frame::with_face(Some(0.53125), closed.clone()));
        p.handle_frame(&Frame::with_face(Some(0.5625), closed));
        p.handle_frame(&frame(0.59375, Point2::new(110.0, 100.0)));

        let recorded = sink.0.lock().unwrap().events.clone();
        assert!(matches!(recorded.first(), Some(SinkEvent::Move(x, 540)) if *x > 960));
        assert_eq!(recorded.last(), Some(&SinkEvent::Click(Button::Right)));

        let seen: Vec<DaemonEvent> = events.try_iter().collect();
        assert!(seen.contains(&DaemonEvent::Engine(Notification::Calibrated {
            profile: "test".into(),
            reference: Point2::new(100.0, 100.0)
        })));
        assert!(seen.contains(&DaemonEvent::Click(Button::Right)));
    }

    #[test]
    fn status_reply_and_shutdown() {
        let (mut p, _sink, _events) = pipeline();
        let (tx, rx) = channel();
        assert!(p.handle_control(ControlMsg::Command(Command::ToggleTracking, Some(tx))));
        assert_eq!(rx.recv().unwrap().state, TrackingState::Calibrating);
        assert!(!p.handle_control(ControlMsg::Shutdown));
    }

    #[test]
    fn thread_serves_commands_after_source_closes() {
        let (p, _sink, events) = pipeline();
        let (ftx, frx) = std::sync::mpsc::sync_channel(1);
        drop(ftx);
        let handle = p.spawn(frx);
        let closed = events.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(closed, DaemonEvent::SourceClosed);
        let (tx, rx) = channel();
        handle.control.send(ControlMsg::Status(tx)).unwrap();
        assert_eq!(rx.recv().unwrap().state, TrackingState::Idle);
        handle.shutdown();
    }

    #[test]
    fn events_serialise_for_watchers() {
        let v = DaemonEvent::Engine(Notification::State {
            state: TrackingState::Paused,
        })
        .to_json();
        assert_eq!(v, json!({"event": "state", "state": "paused"}));
        assert_eq!(
            DaemonEvent::Click(Button::Left).to_json(),
            json!({"event": "click", "button": "left"})
        );
    }
}
