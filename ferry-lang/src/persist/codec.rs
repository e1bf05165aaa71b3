//! The snapshot byte format.
//!
//! A snapshot is the magic bytes `FRRY`, a format version byte, and one
//! encoded root value. Every value starts with a tag byte. Integers are
//! little endian, and lengths and counts are `u32`.
//!
//! Heap objects are numbered in the order they are first written. Writing an
//! object a second time, including from inside itself, emits a back
//! reference to its number, so shared and cyclic structures decode with the
//! same shape. Objects and callbacks found in the permanent table are written
//! by name and never by value.

use std::io::{self, Read, Write};

use ahash::AHashMap;

use crate::error::{Error, Expected};
use crate::opaque;
use crate::runtime::coroutine::{Coroutine, CoroutineStatus};
use crate::runtime::function::Function;
use crate::runtime::table::{Key, Table};
use crate::runtime::value::{ObjectId, Value};
use crate::vm::{Object, Vm};

use super::permanents::{Forward, Reverse};

const MAGIC: &[u8; 4] = b"FRRY";
const VERSION: u8 = 1;
const MAX_DEPTH: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Tag {
    Nil = 0,
    False = 1,
    True = 2,
    Int = 3,
    Float = 4,
    String = 5,
    BackReference = 6,
    Permanent = 7,
    Table = 8,
    Closure = 9,
    Opaque = 10,
    Thread = 11,
}

impl TryFrom<u8> for Tag {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Tag::Nil,
            1 => Tag::False,
            2 => Tag::True,
            3 => Tag::Int,
            4 => Tag::Float,
            5 => Tag::String,
            6 => Tag::BackReference,
            7 => Tag::Permanent,
            8 => Tag::Table,
            9 => Tag::Closure,
            10 => Tag::Opaque,
            11 => Tag::Thread,
            other => {
                return Err(Error::persistence(format_args!(
                    "unknown value tag {other}"
                )))
            }
        })
    }
}

fn io_error(err: &io::Error) -> Error {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        Error::persistence("unexpected end of snapshot")
    } else {
        Error::persistence(format_args!("snapshot i/o failed: {err}"))
    }
}

/// Writes `root` and everything reachable from it to `writer`.
///
/// Fails without writing a complete snapshot if any function or opaque
/// object cannot be named through `permanents`.
pub fn dump<W: Write>(
    vm: &Vm,
    permanents: Forward<'_>,
    root: &Value,
    writer: W,
) -> Expected<()> {
    let mut encoder = Encoder {
        vm,
        permanents,
        writer,
        seen: AHashMap::new(),
        depth: 0,
    };
    encoder.bytes(MAGIC)?;
    encoder.bytes(&[VERSION])?;
    encoder.value(root)?;
    encoder.writer.flush().map_err(|err| io_error(&err))
}

struct Encoder<'a, W> {
    vm: &'a Vm,
    permanents: Forward<'a>,
    writer: W,
    seen: AHashMap<ObjectId, u32>,
    depth: usize,
}

impl<W: Write> Encoder<'_, W> {
    fn bytes(&mut self, bytes: &[u8]) -> Expected<()> {
        self.writer.write_all(bytes).map_err(|err| io_error(&err))
    }

    fn tag(&mut self, tag: Tag) -> Expected<()> {
        self.bytes(&[tag as u8])
    }

    fn count(&mut self, count: usize) -> Expected<()> {
        let count = u32::try_from(count)
            .map_err(|_| Error::persistence("collection too large for a snapshot"))?;
        self.bytes(&count.to_le_bytes())
    }

    fn string(&mut self, value: &str) -> Expected<()> {
        self.count(value.len())?;
        self.bytes(value.as_bytes())
    }

    fn value(&mut self, value: &Value) -> Expected<()> {
        match value {
            Value::Nil => self.tag(Tag::Nil),
            Value::Bool(false) => self.tag(Tag::False),
            Value::Bool(true) => self.tag(Tag::True),
            Value::Int(value) => {
                self.tag(Tag::Int)?;
                self.bytes(&value.to_le_bytes())
            }
            Value::Float(value) => {
                self.tag(Tag::Float)?;
                self.bytes(&value.to_bits().to_le_bytes())
            }
            Value::String(value) => {
                self.tag(Tag::String)?;
                self.string(value)
            }
            Value::Table(id) | Value::Function(id) | Value::Opaque(id) | Value::Thread(id) => {
                self.object(value, *id)
            }
        }
    }

    fn object(&mut self, value: &Value, id: ObjectId) -> Expected<()> {
        if let Some(name) = self.permanents.object(id) {
            self.tag(Tag::Permanent)?;
            return self.string(name);
        }
        if let Some(&index) = self.seen.get(&id) {
            self.tag(Tag::BackReference)?;
            return self.bytes(&index.to_le_bytes());
        }
        let index = u32::try_from(self.seen.len())
            .map_err(|_| Error::persistence("too many objects for a snapshot"))?;
        self.seen.insert(id, index);

        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(Error::persistence("values are nested too deeply to snapshot"));
        }
        let result = match value {
            Value::Table(_) => self.table(id),
            Value::Function(_) => self.function(id),
            Value::Opaque(_) => self.opaque(id),
            _ => self.thread(id),
        };
        self.depth -= 1;
        result
    }

    fn table(&mut self, id: ObjectId) -> Expected<()> {
        let table = self.vm.heap.table(id).ok_or(Error::ObjectCollected)?;
        let metatable = table.metatable.map(Value::Table);
        let entries = table
            .iter()
            .map(|(key, value)| (key.to_value(), value.clone()))
            .collect::<Vec<_>>();
        self.tag(Tag::Table)?;
        self.count(entries.len())?;
        for (key, value) in &entries {
            self.value(key)?;
            self.value(value)?;
        }
        self.value(&metatable.unwrap_or_default())
    }

    fn function(&mut self, id: ObjectId) -> Expected<()> {
        let function = self.vm.heap.function(id).ok_or(Error::ObjectCollected)?;
        let Some(name) = self.permanents.callback(&function.callback) else {
            return Err(Error::persistence(format_args!(
                "function {id:?} calls a callback that has no permanent name"
            )));
        };
        let upvalues = function.upvalues.clone();
        self.tag(Tag::Closure)?;
        self.string(name)?;
        self.count(upvalues.len())?;
        for upvalue in &upvalues {
            self.value(upvalue)?;
        }
        Ok(())
    }

    fn opaque(&mut self, id: ObjectId) -> Expected<()> {
        let (identity, payload) = opaque::snapshot_payload(self.vm, id)?;
        self.tag(Tag::Opaque)?;
        self.string(identity)?;
        self.string(&payload)
    }

    fn thread(&mut self, id: ObjectId) -> Expected<()> {
        let coroutine = self.vm.heap.coroutine(id).ok_or(Error::ObjectCollected)?;
        let status = match coroutine.status() {
            CoroutineStatus::Suspended => 0,
            CoroutineStatus::Dead => 1,
            other => {
                return Err(Error::persistence(format_args!(
                    "cannot snapshot a {} coroutine",
                    other.name()
                )))
            }
        };
        let pending = coroutine.pending.clone().unwrap_or_default();
        self.tag(Tag::Thread)?;
        self.bytes(&[status])?;
        self.value(&pending)
    }
}

/// Reads a snapshot written by [`dump`], allocating its objects in `vm`.
///
/// The returned value is not rooted. Push or store it before anything can
/// collect garbage.
pub fn undump<R: Read>(vm: &mut Vm, permanents: Reverse<'_>, reader: R) -> Expected<Value> {
    let mut decoder = Decoder {
        vm,
        permanents,
        reader,
        objects: Vec::new(),
        depth: 0,
    };
    let mut header = [0; 5];
    decoder.exact(&mut header)?;
    if &header[..4] != MAGIC {
        return Err(Error::persistence("not a snapshot"));
    }
    if header[4] != VERSION {
        return Err(Error::persistence(format_args!(
            "unsupported snapshot version {}",
            header[4]
        )));
    }
    let root = decoder.value()?;
    let mut trailing = [0; 1];
    match decoder.reader.read(&mut trailing) {
        Ok(0) => Ok(root),
        Ok(_) => Err(Error::persistence("unexpected data after the snapshot")),
        Err(err) => Err(io_error(&err)),
    }
}

struct Decoder<'a, R> {
    vm: &'a mut Vm,
    permanents: Reverse<'a>,
    reader: R,
    objects: Vec<Value>,
    depth: usize,
}

impl<R: Read> Decoder<'_, R> {
    fn exact(&mut self, buffer: &mut [u8]) -> Expected<()> {
        self.reader.read_exact(buffer).map_err(|err| io_error(&err))
    }

    fn u8(&mut self) -> Expected<u8> {
        let mut byte = [0; 1];
        self.exact(&mut byte)?;
        Ok(byte[0])
    }

    fn array<const N: usize>(&mut self) -> Expected<[u8; N]> {
        let mut bytes = [0; N];
        self.exact(&mut bytes)?;
        Ok(bytes)
    }

    fn u32(&mut self) -> Expected<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn count(&mut self) -> Expected<usize> {
        usize::try_from(self.u32()?).map_err(|_| Error::persistence("count out of range"))
    }

    fn string(&mut self) -> Expected<String> {
        let len = self.u32()?;
        let mut bytes = Vec::new();
        (&mut self.reader)
            .take(u64::from(len))
            .read_to_end(&mut bytes)
            .map_err(|err| io_error(&err))?;
        if u64::try_from(bytes.len()).ok() != Some(u64::from(len)) {
            return Err(Error::persistence("unexpected end of snapshot"));
        }
        String::from_utf8(bytes).map_err(|_| Error::persistence("snapshot string is not utf-8"))
    }

    fn register(&mut self, value: Value) -> Expected<()> {
        self.objects.try_reserve(1)?;
        self.objects.push(value);
        Ok(())
    }

    fn value(&mut self) -> Expected<Value> {
        let tag = Tag::try_from(self.u8()?)?;
        match tag {
            Tag::Nil => Ok(Value::Nil),
            Tag::False => Ok(Value::Bool(false)),
            Tag::True => Ok(Value::Bool(true)),
            Tag::Int => Ok(Value::Int(i64::from_le_bytes(self.array()?))),
            Tag::Float => Ok(Value::Float(f64::from_bits(u64::from_le_bytes(
                self.array()?,
            )))),
            Tag::String => Ok(Value::from(self.string()?)),
            Tag::BackReference => {
                let index = self.count()?;
                self.objects.get(index).cloned().ok_or_else(|| {
                    Error::persistence(format_args!("invalid back reference {index}"))
                })
            }
            Tag::Permanent => {
                let name = self.string()?;
                self.permanents.object(self.vm, &name)
            }
            Tag::Table | Tag::Closure | Tag::Opaque | Tag::Thread => {
                self.depth += 1;
                if self.depth > MAX_DEPTH {
                    return Err(Error::persistence("snapshot is nested too deeply"));
                }
                let result = match tag {
                    Tag::Table => self.table(),
                    Tag::Closure => self.closure(),
                    Tag::Opaque => self.opaque(),
                    _ => self.thread(),
                };
                self.depth -= 1;
                result
            }
        }
    }

    fn table(&mut self) -> Expected<Value> {
        let id = self.vm.allocate(Object::Table(Table::new()));
        self.register(Value::Table(id))?;
        let count = self.count()?;
        for _ in 0..count {
            let key = Key::from_value(&self.value()?)?;
            let value = self.value()?;
            self.vm
                .heap
                .table_mut(id)
                .ok_or(Error::ObjectCollected)?
                .set(key, value);
        }
        let metatable = match self.value()? {
            Value::Nil => None,
            Value::Table(metatable) => Some(metatable),
            other => {
                return Err(Error::persistence(format_args!(
                    "a {} value cannot be a metatable",
                    other.kind()
                )))
            }
        };
        self.vm
            .heap
            .table_mut(id)
            .ok_or(Error::ObjectCollected)?
            .metatable = metatable;
        Ok(Value::Table(id))
    }

    fn closure(&mut self) -> Expected<Value> {
        let name = self.string()?;
        let callback = self.permanents.callback(&name)?;
        let id = self.vm.allocate(Object::Function(Function::new(callback)));
        self.register(Value::Function(id))?;
        let count = self.count()?;
        for _ in 0..count {
            let upvalue = self.value()?;
            let function = self.vm.heap.function_mut(id).ok_or(Error::ObjectCollected)?;
            function.upvalues.try_reserve(1)?;
            function.upvalues.push(upvalue);
        }
        Ok(Value::Function(id))
    }

    fn opaque(&mut self) -> Expected<Value> {
        let identity = self.string()?;
        let payload = self.string()?;
        let block = opaque::restore_payload(self.vm, &identity, &payload)?;
        let id = self.vm.allocate(Object::Opaque(block));
        let value = Value::Opaque(id);
        self.register(value.clone())?;
        Ok(value)
    }

    fn thread(&mut self) -> Expected<Value> {
        let status = match self.u8()? {
            0 => CoroutineStatus::Suspended,
            1 => CoroutineStatus::Dead,
            other => {
                return Err(Error::persistence(format_args!(
                    "invalid coroutine status {other}"
                )))
            }
        };
        let id = self.vm.allocate(Object::Thread(Coroutine {
            status,
            pending: None,
        }));
        self.register(Value::Thread(id))?;
        let pending = match self.value()? {
            Value::Nil => None,
            function @ Value::Function(_) => Some(function),
            other => {
                return Err(Error::persistence(format_args!(
                    "a coroutine cannot resume a {} value",
                    other.kind()
                )))
            }
        };
        self.vm
            .heap
            .coroutine_mut(id)
            .ok_or(Error::ObjectCollected)?
            .pending = pending;
        Ok(Value::Thread(id))
    }
}
