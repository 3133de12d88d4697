//! Wire format of the control daemon's local API.
//!
//! Messages are UTF-8 JSON objects terminated by a single ETX byte. The
//! daemon talks to its camera process with `process_status_update`
//! notifications whose `status.video_stream_request` member carries the
//! actual request; the camera answers with a `Video/VideoStreamReply`.

use serde::{Deserialize, Serialize};
use serde_json::ser::Formatter;
use serde_json::Value;
use std::io;

use crate::error::{Error, Result};

/// Message delimiter (ETX, end of text).
pub const ETX: u8 = 0x03;
/// Largest payload accepted before a delimiter must appear.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

pub const STATUS_UPDATE_METHOD: &str = "process_status_update";
pub const VIDEO_REPLY_METHOD: &str = "Video/VideoStreamReply";

/// Payloads without this marker are skipped without parsing.
const VIDEO_REQUEST_MARKER: &[u8] = b"\"video_stream_request\"";

/// Methods carried inside `video_stream_request`.
pub mod methods {
    pub const START_LAN_CAPTURE: &str = "startLanCapture";
    pub const STOP_LAN_CAPTURE: &str = "stopLanCapture";
    pub const OPEN_DELAY_CAMERA: &str = "openDelayCamera";
    pub const SET_LED: &str = "SetLed";

    pub const QUERY_LAN_PRINT: &str = "Printer/QueryLanPrintStatus";
    pub const OPEN_LAN_PRINT: &str = "Printer/OpenLanPrint";
}

/// Append the delimiter to a payload.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 1);
    frame.extend_from_slice(payload);
    frame.push(ETX);
    frame
}

/// Splits a byte stream into ETX-delimited payloads.
///
/// Bytes after the last delimiter are kept until the next `push`, so
/// payloads may arrive in any number of chunks.
#[derive(Debug)]
pub struct FrameReader {
    pending: Vec<u8>,
    max_len: usize,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::with_limit(MAX_FRAME_LEN)
    }

    pub fn with_limit(max_len: usize) -> Self {
        Self {
            pending: Vec::new(),
            max_len,
        }
    }

    /// Feed received bytes, returning every payload completed by them.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Vec<u8>>> {
        let mut frames = Vec::new();
        let mut rest = chunk;

        while let Some(pos) = rest.iter().position(|&b| b == ETX) {
            self.check_len(pos)?;
            self.pending.extend_from_slice(&rest[..pos]);
            frames.push(std::mem::take(&mut self.pending));
            rest = &rest[pos + 1..];
        }

        self.check_len(rest.len())?;
        self.pending.extend_from_slice(rest);
        Ok(frames)
    }

    /// Bytes buffered for an unfinished payload.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn check_len(&mut self, extra: usize) -> Result<()> {
        if self.pending.len() + extra > self.max_len {
            let len = self.pending.len() + extra;
            self.pending.clear();
            return Err(Error::Protocol(format!(
                "message exceeds {} bytes without delimiter ({} buffered)",
                self.max_len, len
            )));
        }
        Ok(())
    }
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}

/// Outer envelope of every inbound message.
#[derive(Debug, Deserialize)]
struct Envelope {
    method: String,
    #[serde(default)]
    params: Option<Value>,
}

/// A request the daemon addressed to its camera process.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRequest {
    pub id: i64,
    pub method: String,
    pub params: Option<Value>,
}

impl StreamRequest {
    /// String parameter of the request, if present.
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.as_ref()?.get(key)?.as_str()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    StreamRequest(StreamRequest),
    /// Anything the camera process does not answer.
    Ignored,
}

/// Classify one framed payload.
///
/// Payloads mentioning `video_stream_request` must be valid JSON objects with
/// a string `method`; anything else about them is a protocol error. Requests
/// without a numeric id or string method are not answered by the real camera
/// process either, so they are ignored.
pub fn parse_message(payload: &[u8]) -> Result<Inbound> {
    if !contains(payload, VIDEO_REQUEST_MARKER) {
        return Ok(Inbound::Ignored);
    }

    let text = std::str::from_utf8(payload)
        .map_err(|e| Error::Protocol(format!("message is not UTF-8: {}", e)))?;
    let envelope: Envelope = serde_json::from_str(text)
        .map_err(|e| Error::Protocol(format!("malformed message: {}", e)))?;

    if envelope.method != STATUS_UPDATE_METHOD {
        return Ok(Inbound::Ignored);
    }

    let request = envelope
        .params
        .as_ref()
        .and_then(|p| p.get("status"))
        .and_then(|s| s.get("video_stream_request"));
    let Some(request) = request else {
        return Ok(Inbound::Ignored);
    };

    let id = request
        .get("id")
        .and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)));
    let method = request.get("method").and_then(Value::as_str);

    match (id, method) {
        (Some(id), Some(method)) => Ok(Inbound::StreamRequest(StreamRequest {
            id,
            method: method.to_string(),
            params: request.get("params").cloned(),
        })),
        _ => Ok(Inbound::Ignored),
    }
}

#[derive(Serialize)]
struct ReplyEnvelope<'a> {
    id: u32,
    method: &'static str,
    params: ReplyParams<'a>,
}

#[derive(Serialize)]
struct ReplyParams<'a> {
    eventtime: u32,
    status: ReplyStatus<'a>,
}

#[derive(Serialize)]
struct ReplyStatus<'a> {
    video_stream_reply: VideoStreamReply<'a>,
}

#[derive(Serialize)]
struct VideoStreamReply<'a> {
    id: i64,
    method: &'a str,
    result: EmptyResult,
}

#[derive(Serialize)]
struct EmptyResult {}

/// Framed `Video/VideoStreamReply` acknowledging `request`.
///
/// Rendered exactly the way the vendor camera process prints it, since
/// the daemon is picky about its peer.
pub fn video_reply(request: &StreamRequest) -> Result<Vec<u8>> {
    let reply = ReplyEnvelope {
        id: 0,
        method: VIDEO_REPLY_METHOD,
        params: ReplyParams {
            eventtime: 0,
            status: ReplyStatus {
                video_stream_reply: VideoStreamReply {
                    id: request.id,
                    method: &request.method,
                    result: EmptyResult {},
                },
            },
        },
    };

    let mut out = Vec::with_capacity(320);
    let mut ser = serde_json::Serializer::with_formatter(&mut out, CjsonFormatter::default());
    reply.serialize(&mut ser)?;
    out.push(ETX);
    Ok(out)
}

#[derive(Serialize)]
struct OneShotRequest<'a> {
    id: u32,
    method: &'a str,
    params: Option<Value>,
}

/// Framed request for a one-shot call (`{"id":2016,"method":..,"params":null}`).
pub fn oneshot_request(method: &str) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(&OneShotRequest {
        id: 2016,
        method,
        params: None,
    })?;
    Ok(encode_frame(&body))
}

/// cJSON's formatted printer: tab indentation, `":\t"` after keys and
/// empty objects broken over two lines.
#[derive(Default)]
struct CjsonFormatter {
    depth: usize,
}

impl CjsonFormatter {
    fn indent<W: ?Sized + io::Write>(&self, writer: &mut W) -> io::Result<()> {
        for _ in 0..self.depth {
            writer.write_all(b"\t")?;
        }
        Ok(())
    }
}

impl Formatter for CjsonFormatter {
    fn begin_object<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.depth += 1;
        writer.write_all(b"{")
    }

    fn end_object<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.depth -= 1;
        writer.write_all(b"\n")?;
        self.indent(writer)?;
        writer.write_all(b"}")
    }

    fn begin_object_key<W: ?Sized + io::Write>(
        &mut self,
        writer: &mut W,
        first: bool,
    ) -> io::Result<()> {
        writer.write_all(if first { b"\n" } else { b",\n" })?;
        self.indent(writer)
    }

    fn begin_object_value<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        writer.write_all(b":\t")
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_update(request: &str) -> String {
        format!(
            r#"{{"id":0,"method":"process_status_update","params":{{"eventtime":12.5,"status":{{"video_stream_request":{}}}}}}}"#,
            request
        )
    }

    #[test]
    fn test_frame_round_trip() {
        let payloads: [&[u8]; 4] = [b"", b"hello", b"{\"method\":\"x\"}", &[0xff, 0x00, 0x7f, 0x04]];
        for payload in payloads {
            let mut reader = FrameReader::new();
            let frames = reader.push(&encode_frame(payload)).unwrap();
            assert_eq!(frames, vec![payload.to_vec()]);
            assert_eq!(reader.pending_len(), 0);
        }
    }

    #[test]
    fn test_frames_split_across_chunks() {
        let mut stream = encode_frame(b"first message");
        stream.extend(encode_frame(b"second"));
        stream.extend_from_slice(b"partial");

        let mut reader = FrameReader::new();
        let mut frames = Vec::new();
        for chunk in stream.chunks(3) {
            frames.extend(reader.push(chunk).unwrap());
        }

        assert_eq!(frames, vec![b"first message".to_vec(), b"second".to_vec()]);
        assert_eq!(reader.pending_len(), b"partial".len());

        let frames = reader.push(&[b'!', ETX]).unwrap();
        assert_eq!(frames, vec![b"partial!".to_vec()]);
    }

    #[test]
    fn test_oversized_frame_is_protocol_error() {
        let mut reader = FrameReader::with_limit(8);
        assert!(reader.push(b"12345").unwrap().is_empty());
        let err = reader.push(b"6789").unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert_eq!(reader.pending_len(), 0);

        // Short frames still work after the reset.
        assert_eq!(reader.push(b"ok\x03").unwrap(), vec![b"ok".to_vec()]);
    }

    #[test]
    fn test_parse_stream_request() {
        let msg = status_update(r#"{"id":41,"method":"startLanCapture","params":{"filepath":"/tmp/x"}}"#);
        match parse_message(msg.as_bytes()).unwrap() {
            Inbound::StreamRequest(req) => {
                assert_eq!(req.id, 41);
                assert_eq!(req.method, "startLanCapture");
                assert_eq!(req.param_str("filepath"), Some("/tmp/x"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_float_id_is_accepted() {
        let msg = status_update(r#"{"id":7.0,"method":"SetLed"}"#);
        let Inbound::StreamRequest(req) = parse_message(msg.as_bytes()).unwrap() else {
            panic!("expected a request");
        };
        assert_eq!(req.id, 7);
        assert_eq!(req.params, None);
    }

    #[test]
    fn test_unrelated_messages_are_ignored() {
        let print_stats = r#"{"method":"process_status_update","params":{"status":{"print_stats":{"state":"printing"}}}}"#;
        assert_eq!(parse_message(print_stats.as_bytes()).unwrap(), Inbound::Ignored);

        // Not even JSON, but without the marker it is never parsed.
        assert_eq!(parse_message(b"garbage").unwrap(), Inbound::Ignored);

        let other_method = r#"{"method":"notify","params":{"status":{"video_stream_request":{"id":1,"method":"SetLed"}}}}"#;
        assert_eq!(parse_message(other_method.as_bytes()).unwrap(), Inbound::Ignored);

        let missing_id = status_update(r#"{"method":"SetLed"}"#);
        assert_eq!(parse_message(missing_id.as_bytes()).unwrap(), Inbound::Ignored);
    }

    #[test]
    fn test_malformed_request_is_protocol_error() {
        let truncated = br#"{"method":"process_status_update","params":{"status":{"video_stream_request":{"id":1"#;
        assert!(matches!(parse_message(truncated), Err(Error::Protocol(_))));

        let no_method = br#"{"params":{"status":{"video_stream_request":{"id":1,"method":"SetLed"}}}}"#;
        assert!(matches!(parse_message(no_method), Err(Error::Protocol(_))));

        let mut not_utf8 = b"\"video_stream_request\"".to_vec();
        not_utf8.push(0xff);
        assert!(matches!(parse_message(&not_utf8), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_video_reply_matches_camera_output() {
        let req = StreamRequest {
            id: 1234,
            method: "startLanCapture".to_string(),
            params: None,
        };
        let expected = "{\n\
            \t\"id\":\t0,\n\
            \t\"method\":\t\"Video/VideoStreamReply\",\n\
            \t\"params\":\t{\n\
            \t\t\"eventtime\":\t0,\n\
            \t\t\"status\":\t{\n\
            \t\t\t\"video_stream_reply\":\t{\n\
            \t\t\t\t\"id\":\t1234,\n\
            \t\t\t\t\"method\":\t\"startLanCapture\",\n\
            \t\t\t\t\"result\":\t{\n\
            \t\t\t\t}\n\
            \t\t\t}\n\
            \t\t}\n\
            \t}\n\
            }\x03";
        assert_eq!(String::from_utf8(video_reply(&req).unwrap()).unwrap(), expected);
    }

    #[test]
    fn test_video_reply_is_valid_json() {
        let req = StreamRequest {
            id: 5,
            method: "SetLed".to_string(),
            params: None,
        };
        let reply = video_reply(&req).unwrap();
        assert_eq!(reply.last(), Some(&ETX));

        let value: Value = serde_json::from_slice(&reply[..reply.len() - 1]).unwrap();
        assert_eq!(value["method"], VIDEO_REPLY_METHOD);
        assert_eq!(value["params"]["status"]["video_stream_reply"]["id"], 5);
        assert!(value["params"]["status"]["video_stream_reply"]["result"]
            .as_object()
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_oneshot_request() {
        let frame = oneshot_request(methods::QUERY_LAN_PRINT).unwrap();
        assert_eq!(
            frame,
            b"{\"id\":2016,\"method\":\"Printer/QueryLanPrintStatus\",\"params\":null}\x03".to_vec()
        );
    }
}
