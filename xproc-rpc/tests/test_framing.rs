use std::{
    collections::VecDeque,
    io::{self, Cursor, ErrorKind, Read},
};

use bson::{doc, Bson};
use xproc_rpc::{
    message::{Origin, RequestState, RpcResult, Status},
    message_stream::{
        decode_message, encode_message, FrameReader, ReadFrame, WriteFrame, MAGIC_BYTES,
    },
    Args, Error, Params, Request,
};

mod implementations;

fn frame(payload: &[u8]) -> Vec<u8> {
    let mut buffer = Vec::new();
    buffer.write_frame(payload).unwrap();
    buffer
}

#[test]
fn test_frame_layout() {
    let buffer = frame(b"hello");

    assert_eq!(&buffer[..MAGIC_BYTES.len()], MAGIC_BYTES);
    assert_eq!(&buffer[MAGIC_BYTES.len()..MAGIC_BYTES.len() + 8], b"00000005");
    assert_eq!(&buffer[MAGIC_BYTES.len() + 8..], b"hello");

    let mut cursor = Cursor::new(buffer);
    assert_eq!(cursor.read_frame().unwrap(), b"hello");
    assert!(matches!(cursor.read_frame(), Err(Error::PeerDisconnected)));
}

#[test]
fn test_empty_payload() {
    let mut cursor = Cursor::new(frame(b""));
    assert_eq!(cursor.read_frame().unwrap(), b"");
}

#[test]
fn test_resync_after_garbage() {
    implementations::init_logs();

    let mut stream = b"some garbage [ rpc".to_vec();
    stream.extend(frame(b"first"));
    // Valid marker, broken length field hiding the next marker
    stream.extend(b"[ rpc ]12[ rpc ");
    stream.extend(&frame(b"second")[MAGIC_BYTES.len() - 1..]);
    stream.extend(b"[ rpc ]0000abcd");
    stream.extend(frame(b"third"));

    let mut cursor = Cursor::new(stream);

    assert_eq!(cursor.read_frame().unwrap(), b"first");
    assert_eq!(cursor.read_frame().unwrap(), b"second");
    assert_eq!(cursor.read_frame().unwrap(), b"third");
    assert!(matches!(cursor.read_frame(), Err(Error::PeerDisconnected)));
}

/// Reader returning the chunks one by one. `None` is a read timeout
struct Chunked {
    chunks: VecDeque<Option<Vec<u8>>>,
}

impl Chunked {
    fn new(chunks: Vec<Option<&[u8]>>) -> Self {
        Self {
            chunks: chunks.into_iter().map(|c| c.map(<[u8]>::to_vec)).collect(),
        }
    }
}

impl Read for Chunked {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.chunks.pop_front() {
            None => Ok(0),
            Some(None) => Err(io::Error::new(ErrorKind::WouldBlock, "idle")),
            Some(Some(mut chunk)) => {
                let len = chunk.len().min(buf.len());
                buf[..len].copy_from_slice(&chunk[..len]);

                if len < chunk.len() {
                    self.chunks.push_front(Some(chunk.split_off(len)));
                }
                Ok(len)
            }
        }
    }
}

#[test]
fn test_idle_during_marker_scan() {
    implementations::init_logs();

    let second = frame(b"second");
    let mut reader = Chunked::new(vec![
        Some(b"x".as_slice()),
        None,
        Some(b"garbage[ r".as_slice()),
        None,
        Some(&second[3..]),
        None,
    ]);

    let mut frames = FrameReader::new();

    assert_eq!(frames.read_frame(&mut reader).unwrap(), None);
    assert_eq!(frames.read_frame(&mut reader).unwrap(), None);
    // The marker prefix survives the pause
    assert_eq!(frames.read_frame(&mut reader).unwrap(), Some(b"second".to_vec()));
    assert_eq!(frames.read_frame(&mut reader).unwrap(), None);
    assert!(matches!(
        frames.read_frame(&mut reader),
        Err(Error::PeerDisconnected)
    ));
}

#[test]
fn test_stalled_frame_body() {
    let first = frame(b"stalled");
    let mut reader = Chunked::new(vec![Some(&first[..MAGIC_BYTES.len() + 3]), None]);

    assert!(matches!(
        FrameReader::new().read_frame(&mut reader),
        Err(Error::PeerDisconnected)
    ));
}

#[test]
fn test_truncated_frame() {
    let buffer = frame(b"truncated payload");
    let mut cursor = Cursor::new(buffer[..buffer.len() - 3].to_vec());

    assert!(matches!(cursor.read_frame(), Err(Error::PeerDisconnected)));
}

#[test]
fn test_message_codec() {
    let mut request = Request::new(Params::Call {
        rpcid: 3,
        method: "reflect".into(),
        args: Args::new()
            .with(&42i64)
            .unwrap()
            .with_kw("verbose", &true)
            .unwrap(),
    });
    request.request_id = Some(12);
    request.state = RequestState::Submitted;
    request.stamp("caller_sent");

    let message = request.to_message();
    let decoded = decode_message(&encode_message(&message).unwrap()).unwrap();
    assert_eq!(decoded, message);

    let decoded = Request::from_message(decoded).unwrap();
    let Params::Call { args, .. } = &decoded.params else {
        panic!("Invalid params: {:?}", decoded.params);
    };

    assert_eq!(args.get::<i64>(0).unwrap(), 42);
    assert_eq!(args.kw::<bool>("verbose").unwrap(), Some(true));
    assert_eq!(args.kw::<bool>("quiet").unwrap(), None);
    assert!(args.get::<String>(0).is_err());
    assert!(args.get::<i64>(1).is_err());
}

#[test]
fn test_response_codec() {
    let mut response = Request::new(Params::NodeStatus(Bson::Document(doc! { "load": 0.5 })));
    response.request_id = Some(1);
    response.origin = Origin::Callee;
    response.result = Some(RpcResult::failure(Status::MethodFailed, "trace"));

    let message = response.to_message();
    let decoded = decode_message(&encode_message(&message).unwrap()).unwrap();
    assert_eq!(decoded, message);

    assert!(matches!(
        decoded.result.unwrap().into_result(),
        Err(Error::MethodFailed(text)) if text == "trace"
    ));
}

#[test]
fn test_invalid_payload() {
    assert!(matches!(
        decode_message(b"definitely not bson"),
        Err(Error::ProtocolError(_))
    ));

    let mut message = Request::new(Params::Ready).to_message();
    message.method = xproc_rpc::Method::Call;

    let decoded = decode_message(&encode_message(&message).unwrap()).unwrap();
    assert!(matches!(
        Request::from_message(decoded),
        Err(Error::ProtocolError(_))
    ));
}
