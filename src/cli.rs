use anyhow::{Result, anyhow};
use pico_args::Arguments;
use std::{env, process::Command};

use crate::actions::{Button, PointerSink, UinputSink};
use crate::ipc;
use crate::profile::SettingsPatch;

pub fn run() -> Result<()> {
    let mut pargs = Arguments::from_env();

    // Hidden daemon mode (spawned by `start`)
    if pargs.contains("--daemon") {
        return ipc::run_daemon();
    }

    if env::args().len() == 1 {
        print_help();
        return Ok(());
    }

    if pargs.contains("-h") || pargs.contains("--help") {
        print_help();
        return Ok(());
    }

    let subcmd: Option<String> = pargs.free_from_str().ok();

    match subcmd.as_deref() {
        Some("help") => {
            let topic: Option<String> = pargs.free_from_str().ok();
            match topic {
                Some(t) => print_subcmd_help(&t),
                None => print_help(),
            }
            Ok(())
        }

        Some("start") => {
            let exe = env::current_exe()?;
            let child = Command::new(exe).arg("--daemon").spawn()?;
            println!("facectl: started daemon (pid={})", child.id());
            Ok(())
        }

        Some("stop") => request("shutdown"),
        Some("status") => request("status"),
        Some("toggle") => request("toggle"),
        Some("pause") => request("pause"),
        Some("calibrate") => request("calibrate"),
        Some("reload") => request("reload"),

        Some("use") => {
            let name: String = pargs
                .free_from_str()
                .map_err(|_| anyhow!("usage: facectl use <profile_name>"))?;
            let r = ipc::client_request(serde_json::json!({"op": "use", "profile": name}))?;
            print_response(&r);
            Ok(())
        }

        Some("list") => {
            let r = ipc::client_request(serde_json::json!({"op": "list"}))?;
            print_profile_list(&r);
            Ok(())
        }

        Some("set") => {
            let mut pairs = Vec::new();
            while let Some(p) = pargs.opt_free_from_str::<String>()? {
                pairs.push(p);
            }
            let patch = SettingsPatch::from_pairs(&pairs)?;
            if patch.is_empty() {
                return Err(anyhow!("usage: facectl set key=value [key=value ...]"));
            }
            let r = ipc::client_request(
                serde_json::json!({"op": "set", "settings": patch.to_json()}),
            )?;
            print_response(&r);
            Ok(())
        }

        Some("watch") => ipc::client_watch(|v| println!("{v}")),

        Some("doctor") => {
            // works without a daemon too
            match ipc::client_request(serde_json::json!({"op": "doctor"})) {
                Ok(r) => print_response(&r),
                Err(_) => print_response(&serde_json::json!({
                    "ok": true,
                    "data": ipc::doctor_report(),
                    "daemon": "not running",
                })),
            }
            Ok(())
        }

        Some("emit") => {
            let kind: String = pargs
                .free_from_str()
                .map_err(|_| anyhow!("usage: facectl emit <click|move> ..."))?;
            let mut sink = UinputSink::new()?;
            match kind.as_str() {
                "click" => {
                    let btn: Button = pargs
                        .free_from_str()
                        .map_err(|_| anyhow!("usage: facectl emit click <left|right>"))?;
                    sink.click(btn)?;
                    println!("ok: clicked {btn:?}");
                }
                "move" => {
                    let usage = || anyhow!("usage: facectl emit move <x> <y>");
                    let x: i32 = pargs.free_from_str().map_err(|_| usage())?;
                    let y: i32 = pargs.free_from_str().map_err(|_| usage())?;
                    sink.move_to(x, y)?;
                    println!("ok: moved pointer to ({x}, {y})");
                }
                other => return Err(anyhow!("unknown emit kind: {other}")),
            }
            Ok(())
        }

        Some(other) => {
            eprintln!("unknown subcommand: {other}\n");
            print_help();
            Ok(())
        }

        None => {
            print_help();
            Ok(())
        }
    }
}

fn request(op: &str) -> Result<()> {
    let r = ipc::client_request(serde_json::json!({"op": op}))?;
    print_response(&r);
    Ok(())
}

fn print_help() {
    println!(
        r#"facectl - hands-free pointer control from facial landmarks

USAGE:
  facectl help [command]            Show general or command-specific help
  facectl start                     Start the daemon
  facectl stop                      Stop the daemon
  facectl status                    Show tracking state, calibration and fps
  facectl toggle                    Start or stop tracking
  facectl pause                     Pause or resume cursor output
  facectl calibrate                 Recalibrate (hold your head still)
  facectl use <name>                Switch active profile
  facectl list                      List profiles
  facectl set key=value ...         Change settings of the active profile
  facectl reload                    Reload active profile from disk
  facectl watch                     Stream daemon events
  facectl doctor                    Diagnose uinput permissions and paths
  facectl emit click <left|right>   Emit a mouse click
  facectl emit move <x> <y>         Move the pointer to screen coordinates

GESTURES:
  blink        right click
  open mouth   left click

TIPS:
  - Profiles: ~/.config/facectl/profiles
  - Active profile pointer: ~/.config/facectl/active
  - Daemon tuning: ~/.config/facectl/config.toml
  - Detector socket: ~/.local/run/facectl-landmarks.sock
"#
    );
}

fn print_subcmd_help(cmd: &str) {
    match cmd {
        "start" => println!("usage: facectl start\nStarts the background daemon."),
        "stop" => println!("usage: facectl stop\nStops the running daemon."),
        "status" => println!(
            "usage: facectl status\nShows state, profile, calibration progress, velocity and fps."
        ),
        "toggle" => println!(
            "usage: facectl toggle\nStarts tracking (with calibration) or stops it."
        ),
        "pause" => println!(
            "usage: facectl pause\nPauses or resumes the cursor while keeping calibration."
        ),
        "calibrate" => println!(
            "usage: facectl calibrate\nDrops the reference and collects a new one."
        ),
        "use" => println!(
            "usage: facectl use <name>\nSwitches active profile (created if new) and recalibrates."
        ),
        "list" => println!("usage: facectl list\nLists available profiles; marks active with '*'."),
        "set" => println!(
            "usage: facectl set key=value ...\nkeys: sensitivity, smoothing, blink_threshold,\n      mouth_threshold, region_bounds (x1,y1,x2,y2 | none)"
        ),
        "reload" => println!(
            "usage: facectl reload\nReloads the current profile; keeps last good on error."
        ),
        "watch" => println!("usage: facectl watch\nPrints daemon events as JSON lines."),
        "doctor" => println!("usage: facectl doctor\nChecks uinput access and lists paths."),
        "emit" => println!(
            "usage:\n  facectl emit click <left|right>\n  facectl emit move <x> <y>"
        ),
        _ => {
            eprintln!("unknown command: {cmd}\n");
            print_help();
        }
    }
}

fn print_profile_list(v: &serde_json::Value) {
    let data = &v["data"];
    let (Some(list), Some(active)) = (data["profiles"].as_array(), data["active"].as_str()) else {
        print_response(v);
        return;
    };
    for name in list.iter().filter_map(|n| n.as_str()) {
        let mark = if name == active { '*' } else { ' ' };
        println!("{mark} {name}");
    }
}

fn print_response(v: &serde_json::Value) {
    println!("{}", serde_json::to_string_pretty(v).unwrap_or_default());
}
