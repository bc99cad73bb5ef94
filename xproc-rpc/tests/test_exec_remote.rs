use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use xproc_rpc::{parse_log_line, ChildLevel, ExecRemote};

mod implementations;

use implementations::eventually;

const WAIT: Duration = Duration::from_secs(10);

type Lines = Arc<Mutex<Vec<(ChildLevel, String)>>>;

fn spawn_script(script: &str) -> (ExecRemote, Lines) {
    let lines: Lines = Arc::new(Mutex::new(Vec::new()));

    let sink = {
        let lines = lines.clone();
        move |level, text: &str| lines.lock().unwrap().push((level, text.to_owned()))
    };

    let child = ExecRemote::spawn_with_sink("sh", ["-c", script], sink).unwrap();
    (child, lines)
}

#[test]
fn test_parse_log_line() {
    assert_eq!(
        parse_log_line("ERROR: disk full"),
        Some((ChildLevel::Error, "disk full"))
    );
    assert_eq!(
        parse_log_line("WARNING:low memory "),
        Some((ChildLevel::Warning, "low memory"))
    );
    assert_eq!(parse_log_line("FATAL: gone"), Some((ChildLevel::Fatal, "gone")));
    assert_eq!(parse_log_line("INFO: up"), Some((ChildLevel::Info, "up")));
    assert_eq!(parse_log_line("DEBUG: x=1"), Some((ChildLevel::Debug, "x=1")));

    assert_eq!(parse_log_line("plain output"), None);
    assert_eq!(parse_log_line(" ERROR: indented"), None);
    assert_eq!(parse_log_line("error: lowercase"), None);

    assert_eq!(ChildLevel::Fatal.log_level(), log::Level::Error);
    assert_eq!(ChildLevel::Warning.log_level(), log::Level::Warn);
}

#[test]
fn test_relay_tagged_lines() {
    implementations::init_logs();

    let (mut child, lines) = spawn_script(
        "echo 'ERROR: disk full'; echo 'untagged line'; echo 'WARNING: retrying' >&2; echo 'INFO: done'",
    );

    assert!(eventually(WAIT, || lines.lock().unwrap().len() == 3));
    assert!(eventually(WAIT, || !child.alive()));

    assert_eq!(
        *lines.lock().unwrap(),
        vec![
            (ChildLevel::Error, "disk full".to_owned()),
            (ChildLevel::Warning, "retrying".to_owned()),
            (ChildLevel::Info, "done".to_owned()),
        ]
    );

    child.finish();
    assert_eq!(child.exit_code(), Some(0));
}

#[test]
fn test_fatal_line_ends_supervision() {
    implementations::init_logs();

    let (child, lines) = spawn_script("echo 'FATAL: out of luck'; exec sleep 30");

    assert!(eventually(WAIT, || !child.alive()));
    assert_eq!(
        *lines.lock().unwrap(),
        vec![(ChildLevel::Fatal, "out of luck".to_owned())]
    );
    assert_eq!(child.exit_code(), Some(-15));
}

#[test]
fn test_finish_terminates_child() {
    implementations::init_logs();

    let (mut child, _lines) = spawn_script("exec sleep 30");
    assert!(child.alive());
    assert!(child.pid() > 0);

    child.finish();
    assert!(!child.alive());
    assert_eq!(child.exit_code(), Some(-15));
}

#[test]
fn test_exit_code() {
    implementations::init_logs();

    let (mut child, _lines) = spawn_script("exit 3");

    assert!(eventually(WAIT, || !child.alive()));
    child.finish();
    assert_eq!(child.exit_code(), Some(3));
}

#[test]
fn test_missing_program() {
    assert!(matches!(
        ExecRemote::spawn("/definitely/not/a/program", Vec::<String>::new()),
        Err(xproc_rpc::Error::SpawnFailed(_))
    ));
}
