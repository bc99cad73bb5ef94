#![allow(dead_code)]

pub mod classes;

use std::{
    os::unix::net::UnixStream,
    thread,
    time::{Duration, Instant},
};

use xproc_rpc::{
    message::{Origin, RpcMessage, RpcResult},
    message_stream::{decode_message, encode_message, ReadFrame, WriteFrame},
    HostConfig, Request, RpcHost, RpcRemote,
};

pub fn init_logs() {
    let _ = pretty_env_logger::formatted_builder()
        .filter_level(log::LevelFilter::Debug)
        .try_init();
}

pub fn test_config(name: &str) -> HostConfig {
    HostConfig::new(name)
        .poll_interval(Duration::from_millis(20))
        .request_timeout(Some(Duration::from_secs(5)))
        .shutdown_timeout(Duration::from_secs(2))
}

/// Master and client host connected with a socket pair.
/// The client is peer 1 of the master
pub struct HostPair {
    pub master: RpcHost,
    pub client: RpcHost,
    pub remote: RpcRemote,
}

impl HostPair {
    pub fn connect() -> Self {
        let master = RpcHost::new(test_config("master").master(true));
        let client = RpcHost::new(test_config("client"));

        master.start().unwrap();
        client.start().unwrap();

        let (master_end, client_end) = UnixStream::pair().unwrap();

        master.manage(1, master_end).unwrap();
        master.announce(1).unwrap();

        let remote = RpcRemote::from_stream(&client, client_end).unwrap();

        Self {
            master,
            client,
            remote,
        }
    }

    pub fn finish(self) {
        self.master.finish();
        self.client.finish();
    }
}

/// Started host with peer 0 driven by the test through the returned socket
pub fn raw_peer(name: &str) -> (RpcHost, UnixStream) {
    raw_peer_with(test_config(name))
}

pub fn raw_peer_with(config: HostConfig) -> (RpcHost, UnixStream) {
    let host = RpcHost::new(config);
    host.start().unwrap();

    let (host_end, test_end) = UnixStream::pair().unwrap();
    host.manage(0, host_end).unwrap();

    test_end
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    (host, test_end)
}

pub fn read_message(mut stream: &UnixStream) -> RpcMessage {
    let payload = stream.read_frame().unwrap();
    decode_message(&payload).unwrap()
}

pub fn write_message(mut stream: &UnixStream, message: &RpcMessage) {
    let payload = encode_message(message).unwrap();
    stream.write_frame(&payload).unwrap();
}

/// Response to a request read from the raw socket
pub fn response_to(message: RpcMessage, result: RpcResult) -> RpcMessage {
    let mut request = Request::from_message(message).unwrap();
    request.origin = Origin::Callee;
    request.result = Some(result);

    request.to_message()
}

/// Poll `condition` until it holds or the timeout elapses
pub fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;

    while Instant::now() < deadline {
        if condition() {
            return true;
        }

        thread::sleep(Duration::from_millis(10));
    }

    condition()
}
