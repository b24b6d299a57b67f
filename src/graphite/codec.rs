//! Wire codec for the Graphite pickle listener.
//!
//! A frame is a 4-byte big-endian payload length followed by the payload. The
//! default payload is a pickle (protocol 2) list of `(name, (timestamp, value))`
//! tuples, which is what carbon's pickle receiver unpickles. Only the opcodes
//! needed for that shape are produced; decoding additionally accepts the
//! variants CPython emits for the same data (memo ops, small ints, protocol 4
//! framing) so frames captured from other senders can be inspected.

use super::error::CodecError;
use super::Metric;

/// Size of the big-endian length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Metrics per MARK/APPENDS batch, matching CPython's batching.
const APPENDS_BATCH: usize = 1000;

const PROTO: u8 = 0x80;
const FRAME: u8 = 0x95;
const STOP: u8 = b'.';
const MARK: u8 = b'(';
const EMPTY_LIST: u8 = b']';
const APPEND: u8 = b'a';
const APPENDS: u8 = b'e';
const TUPLE: u8 = b't';
const TUPLE2: u8 = 0x86;
const BINUNICODE: u8 = b'X';
const SHORT_BINUNICODE: u8 = 0x8c;
const BINFLOAT: u8 = b'G';
const BININT: u8 = b'J';
const BININT1: u8 = b'K';
const BININT2: u8 = b'M';
const LONG1: u8 = 0x8a;
const BINPUT: u8 = b'q';
const LONG_BINPUT: u8 = b'r';
const MEMOIZE: u8 = 0x94;

/// Pluggable payload serialization. Framing is fixed and handled by [`frame`].
pub trait MetricCodec: Send + Sync {
    /// Returns the codec name for logging.
    fn name(&self) -> &'static str;

    /// Serialize a batch of metrics into one payload.
    fn encode(&self, metrics: &[Metric]) -> Result<Vec<u8>, CodecError>;

    /// Deserialize one payload back into metrics.
    fn decode(&self, payload: &[u8]) -> Result<Vec<Metric>, CodecError>;
}

/// Pickle protocol 2 codec.
#[derive(Debug, Default, Clone, Copy)]
pub struct PickleCodec;

impl MetricCodec for PickleCodec {
    fn name(&self) -> &'static str {
        "pickle"
    }

    fn encode(&self, metrics: &[Metric]) -> Result<Vec<u8>, CodecError> {
        let approx: usize = metrics.iter().map(|m| m.name.len() + 28).sum();
        let mut out = Vec::with_capacity(approx + 8);

        out.extend_from_slice(&[PROTO, 2, EMPTY_LIST]);

        for chunk in metrics.chunks(APPENDS_BATCH) {
            out.push(MARK);
            for metric in chunk {
                let name = metric.name.as_bytes();
                let len = u32::try_from(name.len())
                    .map_err(|_| CodecError::PayloadTooLarge { len: name.len() })?;

                out.push(BINUNICODE);
                out.extend_from_slice(&len.to_le_bytes());
                out.extend_from_slice(name);

                out.push(BINFLOAT);
                out.extend_from_slice(&metric.timestamp.to_be_bytes());
                out.push(BINFLOAT);
                out.extend_from_slice(&metric.value.to_be_bytes());

                out.push(TUPLE2);
                out.push(TUPLE2);
            }
            out.push(APPENDS);
        }

        out.push(STOP);
        Ok(out)
    }

    fn decode(&self, payload: &[u8]) -> Result<Vec<Metric>, CodecError> {
        let value = Unpickler::new(payload).run()?;

        let Value::List(items) = value else {
            return Err(CodecError::Malformed("top-level object is not a list"));
        };

        items.into_iter().map(metric_from_value).collect()
    }
}

/// Prefix `payload` with its big-endian length.
pub fn frame(payload: &[u8]) -> Result<Vec<u8>, CodecError> {
    let len = u32::try_from(payload.len())
        .map_err(|_| CodecError::PayloadTooLarge { len: payload.len() })?;

    let mut out = Vec::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Split the first complete frame off `buf`.
///
/// Returns the payload and the number of bytes consumed, or `None` when `buf`
/// does not yet hold a whole frame.
pub fn read_frame(buf: &[u8]) -> Option<(&[u8], usize)> {
    let prefix: [u8; LENGTH_PREFIX_SIZE] = buf.get(..LENGTH_PREFIX_SIZE)?.try_into().ok()?;
    let len = u32::from_be_bytes(prefix) as usize;
    let end = LENGTH_PREFIX_SIZE.checked_add(len)?;
    let payload = buf.get(LENGTH_PREFIX_SIZE..end)?;
    Some((payload, end))
}

// --- Decoding ---

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Mark,
    Str(String),
    Num(f64),
    Tuple(Vec<Value>),
    List(Vec<Value>),
}

fn metric_from_value(value: Value) -> Result<Metric, CodecError> {
    let Value::Tuple(mut outer) = value else {
        return Err(CodecError::Malformed("list item is not a tuple"));
    };
    if outer.len() != 2 {
        return Err(CodecError::Malformed("metric tuple must have two items"));
    }
    let pair = outer.pop();
    let name = outer.pop();

    let (Some(Value::Str(name)), Some(Value::Tuple(pair))) = (name, pair) else {
        return Err(CodecError::Malformed("expected (str, tuple)"));
    };

    match pair.as_slice() {
        [Value::Num(timestamp), Value::Num(value)] => Ok(Metric {
            name,
            value: *value,
            timestamp: *timestamp,
        }),
        _ => Err(CodecError::Malformed("expected (timestamp, value)")),
    }
}

struct Unpickler<'a> {
    data: &'a [u8],
    pos: usize,
    stack: Vec<Value>,
}

impl<'a> Unpickler<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            stack: Vec::with_capacity(16),
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        let end = self
            .pos
            .checked_add(n)
            .ok_or(CodecError::Truncated { offset: self.pos })?;
        let bytes = self
            .data
            .get(self.pos..end)
            .ok_or(CodecError::Truncated { offset: self.pos })?;
        self.pos = end;
        Ok(bytes)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let offset = self.pos;
        self.take(N)?
            .try_into()
            .map_err(|_| CodecError::Truncated { offset })
    }

    fn pop(&mut self) -> Result<Value, CodecError> {
        self.stack
            .pop()
            .ok_or(CodecError::Malformed("stack underflow"))
    }

    fn pop_to_mark(&mut self) -> Result<Vec<Value>, CodecError> {
        let mark = self
            .stack
            .iter()
            .rposition(|v| *v == Value::Mark)
            .ok_or(CodecError::Malformed("missing mark"))?;
        let items = self.stack.split_off(mark + 1);
        self.stack.pop();
        Ok(items)
    }

    fn extend_list(&mut self, items: Vec<Value>) -> Result<(), CodecError> {
        match self.stack.last_mut() {
            Some(Value::List(list)) => {
                list.extend(items);
                Ok(())
            }
            _ => Err(CodecError::Malformed("append target is not a list")),
        }
    }

    fn run(mut self) -> Result<Value, CodecError> {
        loop {
            let offset = self.pos;
            let [opcode] = self.take_array::<1>()?;

            match opcode {
                PROTO => {
                    self.take(1)?;
                }
                FRAME => {
                    self.take(8)?;
                }
                STOP => return self.pop(),
                MARK => self.stack.push(Value::Mark),
                EMPTY_LIST => self.stack.push(Value::List(Vec::new())),
                APPEND => {
                    let item = self.pop()?;
                    self.extend_list(vec![item])?;
                }
                APPENDS => {
                    let items = self.pop_to_mark()?;
                    self.extend_list(items)?;
                }
                TUPLE => {
                    let items = self.pop_to_mark()?;
                    self.stack.push(Value::Tuple(items));
                }
                TUPLE2 => {
                    let second = self.pop()?;
                    let first = self.pop()?;
                    self.stack.push(Value::Tuple(vec![first, second]));
                }
                BINUNICODE => {
                    let len = u32::from_le_bytes(self.take_array::<4>()?) as usize;
                    let s = self.take_str(len)?;
                    self.stack.push(Value::Str(s));
                }
                SHORT_BINUNICODE => {
                    let [len] = self.take_array::<1>()?;
                    let s = self.take_str(usize::from(len))?;
                    self.stack.push(Value::Str(s));
                }
                BINFLOAT => {
                    let v = f64::from_be_bytes(self.take_array::<8>()?);
                    self.stack.push(Value::Num(v));
                }
                BININT => {
                    let v = i32::from_le_bytes(self.take_array::<4>()?);
                    self.stack.push(Value::Num(f64::from(v)));
                }
                BININT1 => {
                    let [v] = self.take_array::<1>()?;
                    self.stack.push(Value::Num(f64::from(v)));
                }
                BININT2 => {
                    let v = u16::from_le_bytes(self.take_array::<2>()?);
                    self.stack.push(Value::Num(f64::from(v)));
                }
                LONG1 => {
                    let [len] = self.take_array::<1>()?;
                    let v = self.take_long(usize::from(len))?;
                    self.stack.push(Value::Num(v as f64));
                }
                BINPUT => {
                    self.take(1)?;
                }
                LONG_BINPUT => {
                    self.take(4)?;
                }
                MEMOIZE => {}
                other => {
                    return Err(CodecError::UnsupportedOpcode {
                        opcode: other,
                        offset,
                    })
                }
            }
        }
    }

    fn take_str(&mut self, len: usize) -> Result<String, CodecError> {
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::Malformed("invalid utf-8"))
    }

    /// Little-endian two's complement integer of up to 8 bytes.
    fn take_long(&mut self, len: usize) -> Result<i64, CodecError> {
        if len > 8 {
            return Err(CodecError::Malformed("integer wider than 64 bits"));
        }
        let bytes = self.take(len)?;
        let Some(&last) = bytes.last() else {
            return Ok(0);
        };

        let fill = if last & 0x80 != 0 { 0xff } else { 0x00 };
        let mut buf = [fill; 8];
        buf[..len].copy_from_slice(bytes);
        Ok(i64::from_le_bytes(buf))
    }
}
