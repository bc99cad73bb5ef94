use std::{fs, time::Duration};

use xproc_rpc::{Args, RpcHost, RpcListener, RpcObject, RpcRemote};

mod implementations;

use implementations::{classes::Echo, eventually, test_config};

const WAIT: Duration = Duration::from_secs(5);

#[test]
fn test_listener_connections() {
    implementations::init_logs();

    let socket_dir = tempfile::tempdir().unwrap();
    let socket_path = socket_dir.path().join("xproc.socket");

    // Left over by a previous run
    fs::write(&socket_path, b"stale").unwrap();

    let server = RpcHost::new(test_config("server").master(true));
    server.publish::<Echo>();
    server.start().unwrap();

    let mut listener = RpcListener::bind(&server, &socket_path).unwrap();
    assert_eq!(listener.path(), socket_path.as_path());

    let first = RpcHost::new(test_config("first"));
    first.start().unwrap();
    let first_remote = RpcRemote::connect(&first, &socket_path).unwrap();

    let second = RpcHost::new(test_config("second"));
    second.start().unwrap();
    let second_remote = RpcRemote::connect(&second, &socket_path).unwrap();

    assert_eq!(first_remote.peer_id(), 1);
    assert_eq!(second_remote.peer_id(), 2);
    assert!(eventually(WAIT, || server.managed_peers() == vec![1, 2]));

    // Served classes are announced on connect
    first.subscribe::<Echo>(Some(WAIT)).unwrap();
    second.subscribe::<Echo>(Some(WAIT)).unwrap();

    let echo = RpcObject::<Echo>::create(&second, Args::new()).unwrap();
    let value: i64 = echo.call("reflect", Args::new().with(&7i64).unwrap()).unwrap();
    assert_eq!(value, 7);

    listener.stop();
    assert!(!socket_path.exists());

    // Accepted peers outlive the listener
    let value: i64 = echo.call("reflect", Args::new().with(&8i64).unwrap()).unwrap();
    assert_eq!(value, 8);
    drop(echo);

    server.finish();
    assert!(first.wait_for_exit(Some(WAIT)));
    assert!(second.wait_for_exit(Some(WAIT)));

    first.finish();
    second.finish();
}

#[test]
fn test_remote_close() {
    implementations::init_logs();

    let socket_dir = tempfile::tempdir().unwrap();
    let socket_path = socket_dir.path().join("xproc.socket");

    let server = RpcHost::new(test_config("server").master(true));
    server.start().unwrap();
    let _listener = RpcListener::bind(&server, &socket_path).unwrap();

    let client = RpcHost::new(test_config("client"));
    client.publish::<Echo>();
    client.start().unwrap();

    let mut remote = RpcRemote::connect(&client, &socket_path).unwrap();
    server.subscribe::<Echo>(Some(WAIT)).unwrap();
    assert_eq!(server.publishers("Echo"), vec![1]);

    remote.close();
    assert!(client.managed_peers().is_empty());

    // Closing on purpose isn't a lost master
    assert!(!client.exit_requested());

    assert!(eventually(WAIT, || server.managed_peers().is_empty()));
    assert!(server.publishers("Echo").is_empty());

    client.finish();
    server.finish();
}

#[test]
fn test_connect_without_listener() {
    implementations::init_logs();

    let socket_dir = tempfile::tempdir().unwrap();
    let client = RpcHost::new(test_config("client"));

    assert!(matches!(
        RpcRemote::connect(&client, socket_dir.path().join("missing.socket")),
        Err(xproc_rpc::Error::Io(_))
    ));

    client.finish();
}
