//! Landmark frame sources: reader threads that turn detector JSON lines
//! into [`Frame`]s on a bounded channel.

use log::{debug, info, warn};
use std::{
    fs::{self, File},
    io::{self, BufRead, BufReader},
    os::unix::net::UnixListener,
    path::{Path, PathBuf},
    sync::mpsc::SyncSender,
    thread,
};

use super::runtime::landmarks_socket_path;
use crate::config::{SourceConfig, SourceKind};
use crate::error::{FaceError, FaceResult};
use crate::landmarks::Frame;

/// Frames buffered between a reader thread and the pipeline.
pub const FRAME_QUEUE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpEnd {
    /// Input ran out.
    Eof,
    /// Nobody is listening any more.
    Closed,
}

/// Open the configured source and start its reader thread. Binding or
/// opening happens here so a bad source fails startup.
pub fn spawn(cfg: &SourceConfig, tx: SyncSender<Frame>) -> FaceResult<thread::JoinHandle<()>> {
    match cfg.kind {
        SourceKind::Socket => {
            let path = match &cfg.path {
                Some(p) => p.clone(),
                None => landmarks_socket_path()
                    .map_err(|e| FaceError::SourceUnavailable(e.to_string()))?,
            };
            let listener = bind(&path)?;
            Ok(thread::spawn(move || serve_socket(listener, path, tx)))
        }
        SourceKind::Stdin => {
            info!("landmarks: reading frames from stdin");
            Ok(thread::spawn(move || {
                let end = pump(io::stdin().lock(), &tx);
                info!("landmarks: stdin closed ({end:?})");
            }))
        }
        SourceKind::File => {
            let path = cfg
                .path
                .clone()
                .ok_or_else(|| FaceError::SourceUnavailable("no replay file configured".into()))?;
            let file = File::open(&path).map_err(|e| {
                FaceError::SourceUnavailable(format!("{}: {e}", path.display()))
            })?;
            info!("landmarks: replaying {}", path.display());
            Ok(thread::spawn(move || {
                let end = pump(BufReader::new(file), &tx);
                info!("landmarks: replay of {} finished ({end:?})", path.display());
            }))
        }
    }
}

fn bind(path: &Path) -> FaceResult<UnixListener> {
    if path.exists() {
        let _ = fs::remove_file(path);
    }
    UnixListener::bind(path)
        .map_err(|e| FaceError::SourceUnavailable(format!("{}: {e}", path.display())))
}

// One detector at a time; a disconnect just waits for the next one.
fn serve_socket(listener: UnixListener, path: PathBuf, tx: SyncSender<Frame>) {
    info!("landmarks: waiting for detector on {}", path.display());
    for conn in listener.incoming() {
        match conn {
            Ok(stream) => {
                info!("landmarks: detector connected");
                if pump(BufReader::new(stream), &tx) == PumpEnd::Closed {
                    break;
                }
                info!("landmarks: detector disconnected");
            }
            Err(e) => warn!("landmarks: accept failed: {e}"),
        }
    }
    let _ = fs::remove_file(&path);
}

/// Decode lines until EOF or until the receiver hangs up. Bad lines are
/// logged and skipped.
pub fn pump<R: BufRead>(mut reader: R, tx: &SyncSender<Frame>) -> PumpEnd {
    let mut skipped = 0u64;
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("landmarks: read error: {e}");
                break;
            }
        }
        let line = match std::str::from_utf8(&buf) {
            Ok(l) => l,
            Err(e) => {
                skipped += 1;
                warn!("landmarks: dropping frame: not utf-8 ({e})");
                continue;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match Frame::parse_line(line) {
            Ok(frame) => {
                if tx.send(frame).is_err() {
                    return PumpEnd::Closed;
                }
            }
            Err(e) => {
                skipped += 1;
                warn!("landmarks: dropping frame: {e}");
            }
        }
    }
    if skipped > 0 {
        debug!("landmarks: {skipped} malformed lines skipped");
    }
    PumpEnd::Eof
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};
    use std::sync::mpsc;

    fn face_line(t: f64) -> String {
        let pts: Vec<String> = (0..68).map(|i| format!("[{i},{i}]")).collect();
        format!(r#"{{"t": {t}, "points": [{}]}}"#, pts.join(","))
    }

    #[test]
    fn pump_skips_bad_lines() {
        let input = format!(
            "{}\nnot json\n\n{{\"t\": 2.0, \"points\": null}}\n{{\"points\": [[1,2]]}}\n",
            face_line(1.0)
        );
        let (tx, rx) = mpsc::sync_channel(16);
        assert_eq!(pump(Cursor::new(input), &tx), PumpEnd::Eof);
        drop(tx);
        let frames: Vec<Frame> = rx.iter().collect();
        assert_eq!(frames.len(), 2);
        assert!(frames[0].landmarks.is_some());
        assert_eq!(frames[1].timestamp, Some(2.0));
        assert!(frames[1].landmarks.is_none());
    }

    #[test]
    fn pump_survives_invalid_utf8() {
        let mut input = b"{\"t\": 1.0, \"points\": null}\n".to_vec();
        input.extend_from_slice(b"\xff\xfe garbage\n");
        input.extend_from_slice(face_line(2.0).as_bytes());
        input.push(b'\n');
        let (tx, rx) = mpsc::sync_channel(16);
        assert_eq!(pump(Cursor::new(input), &tx), PumpEnd::Eof);
        drop(tx);
        let frames: Vec<Frame> = rx.iter().collect();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].timestamp, Some(2.0));
        assert!(frames[1].landmarks.is_some());
    }

    #[test]
    fn pump_stops_when_receiver_is_gone() {
        let (tx, rx) = mpsc::sync_channel(1);
        drop(rx);
        let input = format!("{}\n{}\n", face_line(1.0), face_line(2.0));
        assert_eq!(pump(Cursor::new(input), &tx), PumpEnd::Closed);
    }

    #[test]
    fn file_source_replays() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "{}", face_line(0.5)).unwrap();
        writeln!(f, "{{}}").unwrap();
        let cfg = SourceConfig {
            kind: SourceKind::File,
            path: Some(f.path().to_path_buf()),
        };
        let (tx, rx) = mpsc::sync_channel(FRAME_QUEUE);
        let handle = spawn(&cfg, tx).unwrap();
        handle.join().unwrap();
        let frames: Vec<Frame> = rx.iter().collect();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].timestamp, Some(0.5));
    }

    #[test]
    fn missing_file_is_unavailable() {
        let cfg = SourceConfig {
            kind: SourceKind::File,
            path: Some(PathBuf::from("/nonexistent/facectl/replay.jsonl")),
        };
        let (tx, _rx) = mpsc::sync_channel(1);
        assert!(matches!(
            spawn(&cfg, tx),
            Err(FaceError::SourceUnavailable(_))
        ));
    }
}
