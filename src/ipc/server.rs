use anyhow::{Result, anyhow};
use log::{debug, error, info, warn};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use serde_json::{Value, json};
use signal_hook::{
    consts::{SIGINT, SIGTERM},
    iterator::Signals,
};
use std::{
    fs,
    io::{self, BufRead, BufReader, Write},
    os::unix::net::{UnixListener, UnixStream},
    path::Path,
    sync::mpsc::{Sender, channel, sync_channel},
    thread,
    time::{Duration, Instant},
};

use super::pipeline::{ControlMsg, DaemonEvent, Pipeline};
use super::runtime::{landmarks_socket_path, socket_path};
use super::source::{self, FRAME_QUEUE};
use crate::actions::UinputSink;
use crate::config::{self, Tuning};
use crate::engine::{Command, Engine, Notification, Status};
use crate::landmarks::Point2;
use crate::profile::{ProfileStore, SettingsPatch};

const REPLY_TIMEOUT: Duration = Duration::from_secs(2);
// Editors write in bursts; wait for the directory to settle.
const RELOAD_SETTLE: Duration = Duration::from_millis(200);
const WATCH_WRITE_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request {
    Status,
    Toggle,
    Pause,
    Calibrate,
    Use { profile: String },
    List,
    Set { settings: Value },
    Reload,
    Watch,
    Doctor,
    Shutdown,
}

enum ProfileOp {
    Use(String),
    Set(SettingsPatch),
    Reload,
    List,
}

type Reply = std::result::Result<Value, String>;

enum IpcMsg {
    Engine(Command, Sender<Status>),
    Status(Sender<Status>),
    Profile(ProfileOp, Sender<Reply>),
    Watch(UnixStream),
    ProfilesChanged,
    Shutdown,
}

pub fn run_daemon() -> Result<()> {
    let tuning = Tuning::load()?;
    let store = ProfileStore::open_default(tuning.tracking.acceleration_factor)?;
    info!("daemon: active profile '{}'", store.active_name());

    let sock = socket_path()?;
    if sock.exists() {
        if UnixStream::connect(&sock).is_ok() {
            return Err(anyhow!("facectl daemon already running at {}", sock.display()));
        }
        let _ = fs::remove_file(&sock);
    }
    let listener = UnixListener::bind(&sock)?;
    listener.set_nonblocking(true)?;
    info!("daemon: listening on {}", sock.display());

    let (tx_req, rx_req) = channel::<IpcMsg>();
    let (tx_evt, rx_evt) = channel::<DaemonEvent>();
    let (tx_frames, rx_frames) = sync_channel(FRAME_QUEUE);

    source::spawn(&tuning.source, tx_frames)?;

    let sink = UinputSink::new().unwrap_or_else(|e| {
        warn!("uinput unavailable ({e}); pointer output disabled");
        UinputSink::noop()
    });
    let engine = Engine::new(tuning.clone(), store.active().clone());
    let pipeline = Pipeline::new(
        engine,
        tuning.gestures.click_cooldown,
        Box::new(sink),
        tx_evt,
    )
    .spawn(rx_frames);
    pipeline
        .control
        .send(ControlMsg::Command(Command::Start, None))
        .map_err(|_| anyhow!("pipeline exited during startup"))?;

    let _watcher = watch_profiles(store.profiles_dir(), tx_req.clone());
    spawn_signal_thread(tx_req.clone())?;

    let mut daemon = Daemon::new(store, pipeline.control.clone());
    'main: loop {
        match listener.accept() {
            Ok((stream, _)) => {
                let tx = tx_req.clone();
                thread::spawn(move || {
                    if let Err(e) = handle_client(stream, tx) {
                        error!("ipc client error: {e}");
                    }
                });
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => warn!("daemon: accept failed: {e}"),
        }

        while let Ok(evt) = rx_evt.try_recv() {
            daemon.on_event(evt);
        }

        while let Ok(msg) = rx_req.try_recv() {
            if !daemon.handle(msg) {
                break 'main;
            }
        }
        daemon.poll_reload(Instant::now());

        thread::sleep(Duration::from_millis(5));
    }

    info!("daemon: shutting down");
    pipeline.shutdown();
    let _ = fs::remove_file(&sock);
    Ok(())
}

/// Main-loop state. Only this thread touches the profile store.
struct Daemon {
    store: ProfileStore,
    control: Sender<ControlMsg>,
    watchers: Vec<UnixStream>,
    reload_due: Option<Instant>,
}

impl Daemon {
    fn new(store: ProfileStore, control: Sender<ControlMsg>) -> Self {
        Self {
            store,
            control,
            watchers: Vec::new(),
            reload_due: None,
        }
    }

    /// `false` means stop.
    fn handle(&mut self, msg: IpcMsg) -> bool {
        match msg {
            IpcMsg::Engine(cmd, reply) => self.forward(ControlMsg::Command(cmd, Some(reply))),
            IpcMsg::Status(reply) => self.forward(ControlMsg::Status(reply)),
            IpcMsg::Profile(op, reply) => {
                let _ = reply.send(self.profile_op(op));
            }
            IpcMsg::Watch(stream) => {
                if let Err(e) = stream.set_write_timeout(Some(WATCH_WRITE_TIMEOUT)) {
                    warn!("daemon: dropping watcher: {e}");
                    return true;
                }
                info!("daemon: watcher attached");
                self.watchers.push(stream);
            }
            IpcMsg::ProfilesChanged => {
                self.reload_due = Some(Instant::now() + RELOAD_SETTLE);
            }
            IpcMsg::Shutdown => return false,
        }
        true
    }

    fn forward(&self, msg: ControlMsg) {
        if self.control.send(msg).is_err() {
            error!("daemon: pipeline is gone");
        }
    }

    fn profile_op(&mut self, op: ProfileOp) -> Reply {
        match op {
            ProfileOp::Use(name) => {
                let p = self.store.set_active(&name).map_err(|e| e.to_string())?.clone();
                self.forward(ControlMsg::Command(Command::SetProfile(p), None));
                Ok(json!({"active_profile": name}))
            }
            ProfileOp::Set(patch) => {
                let p = self.store.apply_settings(&patch).map_err(|e| e.to_string())?.clone();
                let settings = serde_json::to_value(&p).map_err(|e| e.to_string())?;
                self.forward(ControlMsg::Command(Command::UpdateProfile(p), None));
                Ok(json!({"profile": self.store.active_name(), "settings": settings}))
            }
            ProfileOp::Reload => {
                self.reload().map_err(|e| e.to_string())?;
                Ok(json!({"active_profile": self.store.active_name()}))
            }
            ProfileOp::List => Ok(json!({
                "profiles": self.store.list_profiles(),
                "active": self.store.active_name(),
            })),
        }
    }

    // Keeps the last good profile on error.
    fn reload(&mut self) -> crate::error::FaceResult<()> {
        let before = self.store.active().clone();
        let p = self.store.reload()?.clone();
        if p == before {
            debug!("daemon: profile '{}' unchanged on disk", p.name);
            return Ok(());
        }
        info!("daemon: profile '{}' reloaded", p.name);
        self.forward(ControlMsg::Command(Command::UpdateProfile(p), None));
        Ok(())
    }

    fn poll_reload(&mut self, now: Instant) {
        if self.reload_due.is_some_and(|due| due <= now) {
            self.reload_due = None;
            if let Err(e) = self.reload() {
                warn!("daemon: profile reload failed, keeping previous settings: {e}");
            }
        }
    }

    fn on_event(&mut self, evt: DaemonEvent) {
        if let DaemonEvent::Engine(Notification::Calibrated { profile, reference }) = &evt {
            self.save_calibration(profile, *reference);
        }
        if self.watchers.is_empty() {
            return;
        }
        let line = evt.to_json().to_string() + "\n";
        self.watchers.retain_mut(|w| match w.write_all(line.as_bytes()) {
            Ok(()) => true,
            Err(e) => {
                info!("daemon: watcher detached: {e}");
                false
            }
        });
    }

    // Pending disk edits are applied first so the write does not undo them.
    fn save_calibration(&mut self, profile: &str, reference: Point2) {
        if profile != self.store.active_name() {
            debug!(
                "daemon: calibration for '{profile}' ignored, '{}' is active",
                self.store.active_name()
            );
            return;
        }
        if self.reload_due.take().is_some() {
            if let Err(e) = self.reload() {
                warn!("daemon: profile reload failed, keeping previous settings: {e}");
            }
        }
        if let Err(e) = self.store.record_calibration(reference) {
            warn!("daemon: could not save calibration: {e}");
        }
    }
}

fn watch_profiles(dir: &Path, tx: Sender<IpcMsg>) -> Option<RecommendedWatcher> {
    let handler = move |res: notify::Result<notify::Event>| {
        let Ok(ev) = res else { return };
        let relevant = (ev.kind.is_modify() || ev.kind.is_create() || ev.kind.is_remove())
            && ev
                .paths
                .iter()
                .any(|p| p.extension().is_some_and(|ext| ext == "toml"));
        if relevant {
            let _ = tx.send(IpcMsg::ProfilesChanged);
        }
    };
    let mut watcher = match notify::recommended_watcher(handler) {
        Ok(w) => w,
        Err(e) => {
            warn!("daemon: profile watcher unavailable: {e}");
            return None;
        }
    };
    if let Err(e) = watcher.watch(dir, RecursiveMode::NonRecursive) {
        warn!("daemon: cannot watch {}: {e}", dir.display());
        return None;
    }
    info!("daemon: watching {}", dir.display());
    Some(watcher)
}

fn spawn_signal_thread(tx: Sender<IpcMsg>) -> Result<()> {
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    thread::spawn(move || {
        if let Some(sig) = signals.forever().next() {
            info!("daemon: received signal {sig}");
            let _ = tx.send(IpcMsg::Shutdown);
        }
    });
    Ok(())
}

fn handle_client(mut stream: UnixStream, tx: Sender<IpcMsg>) -> Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut line = String::new();
    reader.read_line(&mut line)?;
    if line.trim().is_empty() {
        return Ok(());
    }
    let req: Request = match serde_json::from_str(&line) {
        Ok(r) => r,
        Err(e) => {
            writeln!(stream, "{}", json!({"ok": false, "error": format!("bad request: {e}")}))?;
            return Ok(());
        }
    };

    match req {
        Request::Watch => {
            writeln!(stream, "{}", json!({"ok": true, "data": "watching"}))?;
            tx.send(IpcMsg::Watch(stream))
                .map_err(|_| anyhow!("daemon is shutting down"))?;
        }
        Request::Shutdown => {
            let _ = tx.send(IpcMsg::Shutdown);
            writeln!(stream, "{}", json!({"ok": true, "data": "shutting down"}))?;
        }
        other => {
            let resp = match respond(other, &tx) {
                Ok(data) => json!({"ok": true, "data": data}),
                Err(e) => json!({"ok": false, "error": e}),
            };
            writeln!(stream, "{resp}")?;
        }
    }
    Ok(())
}

fn respond(req: Request, tx: &Sender<IpcMsg>) -> Reply {
    let engine = |cmd: Command| -> Reply { ask(tx, |r| IpcMsg::Engine(cmd, r)).and_then(status_json) };
    let profile = |op: ProfileOp| -> Reply { ask(tx, |r| IpcMsg::Profile(op, r))? };
    match req {
        Request::Status => ask(tx, IpcMsg::Status).and_then(status_json),
        Request::Toggle => engine(Command::ToggleTracking),
        Request::Pause => engine(Command::TogglePause),
        Request::Calibrate => engine(Command::Recalibrate),
        Request::Use { profile: name } => profile(ProfileOp::Use(name)),
        Request::List => profile(ProfileOp::List),
        Request::Set { settings } => {
            let patch = SettingsPatch::from_json(&settings).map_err(|e| e.to_string())?;
            profile(ProfileOp::Set(patch))
        }
        Request::Reload => profile(ProfileOp::Reload),
        Request::Doctor => Ok(doctor_report()),
        Request::Watch | Request::Shutdown => Err("not a request/response op".into()),
    }
}

fn ask<T>(tx: &Sender<IpcMsg>, make: impl FnOnce(Sender<T>) -> IpcMsg) -> std::result::Result<T, String> {
    let (reply_tx, reply_rx) = channel();
    tx.send(make(reply_tx))
        .map_err(|_| "daemon is shutting down".to_string())?;
    reply_rx
        .recv_timeout(REPLY_TIMEOUT)
        .map_err(|_| "daemon did not answer".to_string())
}

fn status_json(status: Status) -> Reply {
    let mut v = serde_json::to_value(status).map_err(|e| e.to_string())?;
    if let (Some(obj), Ok(sock)) = (v.as_object_mut(), socket_path()) {
        obj.insert("socket".into(), json!(sock));
    }
    Ok(v)
}

/// Environment checks; usable with or without a running daemon.
pub fn doctor_report() -> Value {
    let uinput = Path::new("/dev/uinput");
    json!({
        "user": whoami::username(),
        "uinput_present": uinput.exists(),
        "uinput_writable": fs::OpenOptions::new().write(true).open(uinput).is_ok(),
        "input_group": check_in_input_group(),
        "profiles_dir": config::profiles_dir().ok(),
        "socket": socket_path().ok(),
        "landmarks_socket": landmarks_socket_path().ok(),
    })
}

fn check_in_input_group() -> bool {
    fs::read_to_string("/etc/group")
        .map(|s| group_has_member(&s, "input", &whoami::username()))
        .unwrap_or(false)
}

fn group_has_member(group_file: &str, group: &str, user: &str) -> bool {
    group_file.lines().any(|line| {
        let mut fields = line.split(':');
        fields.next() == Some(group)
            && fields
                .nth(2)
                .unwrap_or("")
                .split(',')
                .any(|u| u.trim() == user)
    })
}

// client helper
pub fn client_request(req: Value) -> Result<Value> {
    let sock = socket_path()?;
    if !sock.exists() {
        return Err(anyhow!(
            "facectl daemon is not running (socket missing at {})",
            sock.display()
        ));
    }
    let mut stream = UnixStream::connect(sock)?;
    let line = serde_json::to_string(&req)? + "\n";
    stream.write_all(line.as_bytes())?;
    let mut reader = BufReader::new(stream);
    let mut resp = String::new();
    reader.read_line(&mut resp)?;
    let v: Value = serde_json::from_str(&resp)?;
    Ok(v)
}

/// Send `watch` and hand every notification line to `on_event` until the
/// daemon goes away.
pub fn client_watch(mut on_event: impl FnMut(Value)) -> Result<()> {
    let sock = socket_path()?;
    let mut stream = UnixStream::connect(&sock)
        .map_err(|e| anyhow!("cannot reach daemon at {}: {e}", sock.display()))?;
    stream.write_all(b"{\"op\":\"watch\"}\n")?;
    for line in BufReader::new(stream).lines() {
        let line = line?;
        let v: Value = serde_json::from_str(&line)?;
        on_event(v);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::TrackingState;
    use std::sync::mpsc::Receiver;

    fn daemon() -> (tempfile::TempDir, Daemon, Receiver<ControlMsg>) {
        let dir = tempfile::tempdir().unwrap();
        let store = ProfileStore::load_or_install_default(
            dir.path(),
            Tuning::default().tracking.acceleration_factor,
        )
        .unwrap();
        let (tx, rx) = channel();
        (dir, Daemon::new(store, tx), rx)
    }

    fn op(d: &mut Daemon, op: ProfileOp) -> Reply {
        let (tx, rx) = channel();
        assert!(d.handle(IpcMsg::Profile(op, tx)));
        rx.recv().unwrap()
    }

    #[test]
    fn parses_requests() {
        let r: Request = serde_json::from_str(r#"{"op":"use","profile":"desk"}"#).unwrap();
        assert_eq!(
            r,
            Request::Use {
                profile: "desk".into()
            }
        );
        let r: Request = serde_json::from_str(r#"{"op":"calibrate"}"#).unwrap();
        assert_eq!(r, Request::Calibrate);
        assert!(serde_json::from_str::<Request>(r#"{"op":"explode"}"#).is_err());
    }

    #[test]
    fn use_switches_and_forces_recalibration() {
        let (_dir, mut d, control) = daemon();
        let reply = op(&mut d, ProfileOp::Use("desk".into())).unwrap();
        assert_eq!(reply["active_profile"], "desk");
        assert_eq!(d.store.active_name(), "desk");
        match control.try_recv() {
            Ok(ControlMsg::Command(Command::SetProfile(p), None)) => assert_eq!(p.name, "desk"),
            _ => panic!("expected SetProfile"),
        }
    }

    #[test]
    fn invalid_settings_change_nothing() {
        let (_dir, mut d, control) = daemon();
        let patch = SettingsPatch::from_json(&json!({"smoothing": 1.5})).unwrap();
        assert!(op(&mut d, ProfileOp::Set(patch)).is_err());
        assert_eq!(d.store.active().smoothing, 0.15);
        assert!(control.try_recv().is_err());

        let patch = SettingsPatch::from_json(&json!({"sensitivity": 2.0})).unwrap();
        let reply = op(&mut d, ProfileOp::Set(patch)).unwrap();
        assert_eq!(reply["settings"]["sensitivity"], 2.0);
        assert!(matches!(
            control.try_recv(),
            Ok(ControlMsg::Command(Command::UpdateProfile(_), None))
        ));
    }

    #[test]
    fn engine_requests_are_forwarded() {
        let (_dir, mut d, control) = daemon();
        let (tx, _rx) = channel();
        assert!(d.handle(IpcMsg::Engine(Command::TogglePause, tx)));
        assert!(matches!(
            control.try_recv(),
            Ok(ControlMsg::Command(Command::TogglePause, Some(_)))
        ));
        assert!(!d.handle(IpcMsg::Shutdown));
    }

    #[test]
    fn calibration_is_saved_and_broadcast() {
        let (_dir, mut d, _control) = daemon();
        let (ours, theirs) = UnixStream::pair().unwrap();
        d.handle(IpcMsg::Watch(ours));
        d.on_event(DaemonEvent::Engine(Notification::Calibrated {
            profile: "default".into(),
            reference: Point2::new(12.0, 34.0),
        }));
        d.on_event(DaemonEvent::Engine(Notification::State {
            state: TrackingState::Tracking,
        }));
        assert_eq!(
            d.store.load("default").unwrap().calibration,
            Some(Point2::new(12.0, 34.0))
        );

        let mut lines = BufReader::new(theirs).lines();
        let first: Value = serde_json::from_str(&lines.next().unwrap().unwrap()).unwrap();
        assert_eq!(first["event"], "calibrated");
        assert_eq!(first["profile"], "default");
        let second: Value = serde_json::from_str(&lines.next().unwrap().unwrap()).unwrap();
        assert_eq!(second["state"], "tracking");
    }

    #[test]
    fn stale_calibration_is_not_written_to_new_profile() {
        let (_dir, mut d, control) = daemon();
        op(&mut d, ProfileOp::Use("desk".into())).unwrap();
        let _ = control.try_recv();
        d.on_event(DaemonEvent::Engine(Notification::Calibrated {
            profile: "default".into(),
            reference: Point2::new(1.0, 2.0),
        }));
        assert_eq!(d.store.load("desk").unwrap().calibration, None);
        assert_eq!(d.store.load("default").unwrap().calibration, None);
    }

    #[test]
    fn calibration_write_does_not_echo_a_reload() {
        let (_dir, mut d, control) = daemon();
        d.on_event(DaemonEvent::Engine(Notification::Calibrated {
            profile: "default".into(),
            reference: Point2::new(5.0, 6.0),
        }));
        d.handle(IpcMsg::ProfilesChanged);
        d.poll_reload(Instant::now() + RELOAD_SETTLE * 2);
        assert!(control.try_recv().is_err());
    }

    #[test]
    fn pending_edit_survives_calibration_write() {
        let (dir, mut d, control) = daemon();
        let path = dir.path().join("profiles/default.toml");
        let edited = fs::read_to_string(&path)
            .unwrap()
            .replace("sensitivity = 1.0", "sensitivity = 3.0");
        assert!(edited.contains("sensitivity = 3.0"));
        fs::write(&path, edited).unwrap();
        d.handle(IpcMsg::ProfilesChanged);
        d.on_event(DaemonEvent::Engine(Notification::Calibrated {
            profile: "default".into(),
            reference: Point2::new(7.0, 8.0),
        }));
        let saved = d.store.load("default").unwrap();
        assert_eq!(saved.sensitivity, 3.0);
        assert_eq!(saved.calibration, Some(Point2::new(7.0, 8.0)));
        assert!(matches!(
            control.try_recv(),
            Ok(ControlMsg::Command(Command::UpdateProfile(p), None)) if p.sensitivity == 3.0
        ));
    }

    #[test]
    fn stalled_watcher_is_dropped() {
        let (_dir, mut d, _control) = daemon();
        let (ours, _stalled) = UnixStream::pair().unwrap();
        d.handle(IpcMsg::Watch(ours));
        assert_eq!(d.watchers.len(), 1);
        let evt = DaemonEvent::Engine(Notification::State {
            state: TrackingState::Tracking,
        });
        for _ in 0..100_000 {
            if d.watchers.is_empty() {
                break;
            }
            d.on_event(evt.clone());
        }
        assert!(d.watchers.is_empty());
    }

    #[test]
    fn profile_changes_reload_after_settling() {
        let (dir, mut d, control) = daemon();
        d.handle(IpcMsg::ProfilesChanged);
        d.poll_reload(Instant::now() + RELOAD_SETTLE * 2);
        assert!(control.try_recv().is_err());

        fs::write(
            dir.path().join("profiles/default.toml"),
            "sensitivity = 2.0\nsmoothing = 0.15\nblink_threshold = 0.23\nmouth_threshold = 0.5\n",
        )
        .unwrap();
        d.handle(IpcMsg::ProfilesChanged);
        d.poll_reload(Instant::now());
        assert!(control.try_recv().is_err());
        d.poll_reload(Instant::now() + RELOAD_SETTLE * 2);
        assert!(matches!(
            control.try_recv(),
            Ok(ControlMsg::Command(Command::UpdateProfile(_), None))
        ));
    }

    #[test]
    fn group_membership() {
        let groups = "wheel:x:10:root\ninput:x:104:alice, bob\ninputx:x:1:carol\n";
        assert!(group_has_member(groups, "input", "bob"));
        assert!(group_has_member(groups, "input", "alice"));
        assert!(!group_has_member(groups, "input", "carol"));
        assert!(!group_has_member(groups, "input", "root"));
    }
}
