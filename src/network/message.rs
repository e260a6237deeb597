// Message model and its tagged binary encoding.
//
// Payload layout: `id: u64 BE | kind: u8 | body`. A request body is the
// command name (u32-length-prefixed UTF-8) followed by a u32 parameter
// count and `u32 len || bytes` per parameter. A response body is a code
// byte, a length-prefixed message, and a result list whose entries are
// either `0xFF` (null) or `0x00 | u32 len | bytes`.

use crate::error::{KvError, Result};
use bytes::{BufMut, BytesMut};

const KIND_REQUEST: u8 = 0;
const KIND_RESPONSE: u8 = 1;

const CODE_SUCCESS: u8 = 0;
const CODE_ERROR: u8 = 1;

const RESULT_PRESENT: u8 = 0x00;
const RESULT_NULL: u8 = 0xff;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub name: String,
    pub params: Vec<Vec<u8>>,
}

impl Command {
    pub fn new(name: &str, params: Vec<Vec<u8>>) -> Self {
        Self {
            name: name.to_string(),
            params,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: ResponseCode,
    pub message: String,
    pub result: Vec<Option<Vec<u8>>>,
}

impl Response {
    pub fn success(result: Vec<Option<Vec<u8>>>) -> Self {
        Self {
            code: ResponseCode::Success,
            message: String::new(),
            result,
        }
    }

    pub fn error(err: &KvError) -> Self {
        Self {
            code: ResponseCode::Error,
            message: format!("{}: {}", err.tag(), err),
            result: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == ResponseCode::Success
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Content {
    Request(Command),
    Response(Response),
}

/// The wire envelope. `id` is client-chosen; a response echoes the id of
/// the request it answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: u64,
    pub content: Content,
}

impl Message {
    pub fn request(id: u64, command: Command) -> Self {
        Self {
            id,
            content: Content::Request(command),
        }
    }

    pub fn response(id: u64, response: Response) -> Self {
        Self {
            id,
            content: Content::Response(response),
        }
    }

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u64(self.id);
        match &self.content {
            Content::Request(command) => {
                buf.put_u8(KIND_REQUEST);
                put_bytes(&mut buf, command.name.as_bytes());
                buf.put_u32(command.params.len() as u32);
                for param in &command.params {
                    put_bytes(&mut buf, param);
                }
            }
            Content::Response(response) => {
                buf.put_u8(KIND_RESPONSE);
                buf.put_u8(match response.code {
                    ResponseCode::Success => CODE_SUCCESS,
                    ResponseCode::Error => CODE_ERROR,
                });
                put_bytes(&mut buf, response.message.as_bytes());
                buf.put_u32(response.result.len() as u32);
                for entry in &response.result {
                    match entry {
                        Some(bytes) => {
                            buf.put_u8(RESULT_PRESENT);
                            put_bytes(&mut buf, bytes);
                        }
                        None => buf.put_u8(RESULT_NULL),
                    }
                }
            }
        }
        buf
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(payload);
        let id = cursor.u64()?;
        let kind = cursor.u8()?;
        let content = match kind {
            KIND_REQUEST => {
                let name = String::from_utf8(cursor.bytes()?)
                    .map_err(|_| KvError::Wire("command name is not UTF-8".into()))?;
                let count = cursor.u32()? as usize;
                let mut params = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    params.push(cursor.bytes()?);
                }
                Content::Request(Command { name, params })
            }
            KIND_RESPONSE => {
                let code = match cursor.u8()? {
                    CODE_SUCCESS => ResponseCode::Success,
                    CODE_ERROR => ResponseCode::Error,
                    other => {
                        return Err(KvError::Wire(format!("bad response code {:#04x}", other)))
                    }
                };
                let message = String::from_utf8(cursor.bytes()?)
                    .map_err(|_| KvError::Wire("response message is not UTF-8".into()))?;
                let count = cursor.u32()? as usize;
                let mut result = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    match cursor.u8()? {
                        RESULT_NULL => result.push(None),
                        RESULT_PRESENT => result.push(Some(cursor.bytes()?)),
                        other => {
                            return Err(KvError::Wire(format!(
                                "bad result entry tag {:#04x}",
                                other
                            )))
                        }
                    }
                }
                Content::Response(Response {
                    code,
                    message,
                    result,
                })
            }
            other => return Err(KvError::Wire(format!("bad message kind {:#04x}", other))),
        };
        cursor.finish()?;
        Ok(Self { id, content })
    }
}

fn put_bytes(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_u32(bytes.len() as u32);
    buf.put_slice(bytes);
}

/// Bounds-checked reader over a payload slice.
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| KvError::Wire("message truncated".into()))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn finish(&self) -> Result<()> {
        if self.pos != self.data.len() {
            return Err(KvError::Wire(format!(
                "{} trailing byte(s) after message",
                self.data.len() - self.pos
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips() {
        let msg = Message::request(
            42,
            Command::new("PUT", vec![b"key".to_vec(), b"value".to_vec()]),
        );
        let decoded = Message::decode(&msg.encode()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn response_round_trips_with_nulls() {
        let msg = Message::response(
            7,
            Response {
                code: ResponseCode::Success,
                message: String::new(),
                result: vec![Some(b"v1".to_vec()), None, Some(vec![])],
            },
        );
        let decoded = Message::decode(&msg.encode()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn error_response_carries_tag_and_id() {
        let err = KvError::NoSuchDb("orders".into());
        let msg = Message::response(99, Response::error(&err));
        let decoded = Message::decode(&msg.encode()).unwrap();
        assert_eq!(decoded.id, 99);
        match decoded.content {
            Content::Response(r) => {
                assert_eq!(r.code, ResponseCode::Error);
                assert!(r.message.starts_with("NO_SUCH_DB"));
            }
            _ => panic!("expected a response"),
        }
    }

    #[test]
    fn junk_is_rejected() {
        assert!(Message::decode(&[]).is_err());
        assert!(Message::decode(&[0; 8]).is_err());

        // Bad kind byte.
        let mut buf = BytesMut::new();
        buf.put_u64(1);
        buf.put_u8(9);
        assert!(matches!(Message::decode(&buf), Err(KvError::Wire(_))));

        // Truncated parameter.
        let msg = Message::request(1, Command::new("GET", vec![b"key".to_vec()]));
        let encoded = msg.encode();
        assert!(Message::decode(&encoded[..encoded.len() - 1]).is_err());

        // Trailing garbage.
        let mut padded = encoded.to_vec();
        padded.push(0);
        assert!(Message::decode(&padded).is_err());
    }
}
