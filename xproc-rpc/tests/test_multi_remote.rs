use std::{thread, time::Duration};

use xproc_rpc::MultiRemote;

mod implementations;

use implementations::eventually;

#[test]
fn test_child_exit_code() {
    implementations::init_logs();

    let mut child = unsafe { MultiRemote::spawn(|| 7) }.unwrap();
    assert!(child.pid() > 0);

    assert_eq!(child.join(), Some(7));
    assert!(!child.alive());
    assert_eq!(child.exit_code(), Some(7));
}

#[test]
fn test_finish_terminates_child() {
    implementations::init_logs();

    let mut child = unsafe {
        MultiRemote::spawn(|| {
            thread::sleep(Duration::from_secs(30));
            0
        })
    }
    .unwrap();

    assert!(child.alive());

    child.finish();
    assert!(!child.alive());
    assert_eq!(child.exit_code(), Some(-15));
}

#[test]
fn test_alive_after_exit() {
    implementations::init_logs();

    let mut child = unsafe { MultiRemote::spawn(|| 0) }.unwrap();

    assert!(eventually(Duration::from_secs(10), || !child.alive()));
    assert_eq!(child.exit_code(), Some(0));
}
