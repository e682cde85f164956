//! GGUF v3 container: metadata key/values, tensor infos, aligned tensor data.

use crate::error::{ExportError, ExportResult};
use crate::quant::GgmlType;
use std::io::{Read, Write};

pub const GGUF_MAGIC: [u8; 4] = *b"GGUF";
pub const GGUF_VERSION: u32 = 3;
pub const GGUF_ALIGNMENT: u64 = 32;

const TYPE_U8: u32 = 0;
const TYPE_I8: u32 = 1;
const TYPE_U16: u32 = 2;
const TYPE_I16: u32 = 3;
const TYPE_U32: u32 = 4;
const TYPE_I32: u32 = 5;
const TYPE_F32: u32 = 6;
const TYPE_BOOL: u32 = 7;
const TYPE_STRING: u32 = 8;
const TYPE_ARRAY: u32 = 9;
const TYPE_U64: u32 = 10;
const TYPE_I64: u32 = 11;
const TYPE_F64: u32 = 12;

#[derive(Debug, Clone, PartialEq)]
pub enum GgufValue {
    U32(u32),
    I32(i32),
    U64(u64),
    F32(f32),
    Bool(bool),
    String(String),
    StringArray(Vec<String>),
    I32Array(Vec<i32>),
}

impl GgufValue {
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::U32(v) => Some(u64::from(*v)),
            Self::U64(v) => Some(*v),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GgufTensor {
    pub name: String,
    /// ggml order: `dims[0]` is the row length.
    pub dims: Vec<u64>,
    pub ggml_type: GgmlType,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct GgufFile {
    pub metadata: Vec<(String, GgufValue)>,
    pub tensors: Vec<GgufTensor>,
}

struct CountingWriter<'a> {
    inner: &'a mut dyn Write,
    written: u64,
}

impl CountingWriter<'_> {
    fn put(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.inner.write_all(bytes)?;
        self.written += bytes.len() as u64;
        Ok(())
    }

    fn put_u32(&mut self, v: u32) -> std::io::Result<()> {
        self.put(&v.to_le_bytes())
    }

    fn put_u64(&mut self, v: u64) -> std::io::Result<()> {
        self.put(&v.to_le_bytes())
    }

    fn put_str(&mut self, s: &str) -> std::io::Result<()> {
        self.put_u64(s.len() as u64)?;
        self.put(s.as_bytes())
    }

    fn pad_to(&mut self, alignment: u64) -> std::io::Result<()> {
        let pad = padding(self.written, alignment);
        self.put(&vec![0u8; pad as usize])
    }

    fn put_value(&mut self, value: &GgufValue) -> std::io::Result<()> {
        match value {
            GgufValue::U32(v) => {
                self.put_u32(TYPE_U32)?;
                self.put_u32(*v)
            }
            GgufValue::I32(v) => {
                self.put_u32(TYPE_I32)?;
                self.put(&v.to_le_bytes())
            }
            GgufValue::U64(v) => {
                self.put_u32(TYPE_U64)?;
                self.put_u64(*v)
            }
            GgufValue::F32(v) => {
                self.put_u32(TYPE_F32)?;
                self.put(&v.to_le_bytes())
            }
            GgufValue::Bool(v) => {
                self.put_u32(TYPE_BOOL)?;
                self.put(&[u8::from(*v)])
            }
            GgufValue::String(s) => {
                self.put_u32(TYPE_STRING)?;
                self.put_str(s)
            }
            GgufValue::StringArray(items) => {
                self.put_u32(TYPE_ARRAY)?;
                self.put_u32(TYPE_STRING)?;
                self.put_u64(items.len() as u64)?;
                items.iter().try_for_each(|s| self.put_str(s))
            }
            GgufValue::I32Array(items) => {
                self.put_u32(TYPE_ARRAY)?;
                self.put_u32(TYPE_I32)?;
                self.put_u64(items.len() as u64)?;
                items.iter().try_for_each(|v| self.put(&v.to_le_bytes()))
            }
        }
    }
}

fn padding(offset: u64, alignment: u64) -> u64 {
    (alignment - offset % alignment) % alignment
}

/// Writes `file` to `out` and returns the number of bytes written.
pub fn write_gguf(file: &GgufFile, out: &mut dyn Write) -> ExportResult<u64> {
    for t in &file.tensors {
        let n: u64 = t.dims.iter().product();
        let expected = t.ggml_type.byte_size(n as usize);
        if t.data.len() != expected {
            return Err(ExportError::Format(format!(
                "tensor {} holds {} bytes, {:?} with {n} elements needs {expected}",
                t.name,
                t.data.len(),
                t.ggml_type
            )));
        }
    }

    let mut w = CountingWriter { inner: out, written: 0 };
    w.put(&GGUF_MAGIC)?;
    w.put_u32(GGUF_VERSION)?;
    w.put_u64(file.tensors.len() as u64)?;
    w.put_u64(file.metadata.len() as u64)?;

    for (key, value) in &file.metadata {
        w.put_str(key)?;
        w.put_value(value)?;
    }

    let mut offset = 0u64;
    for t in &file.tensors {
        w.put_str(&t.name)?;
        w.put_u32(t.dims.len() as u32)?;
        for d in &t.dims {
            w.put_u64(*d)?;
        }
        w.put_u32(t.ggml_type.id())?;
        w.put_u64(offset)?;
        offset += t.data.len() as u64;
        offset += padding(offset, GGUF_ALIGNMENT);
    }

    w.pad_to(GGUF_ALIGNMENT)?;
    for t in &file.tensors {
        w.put(&t.data)?;
        w.pad_to(GGUF_ALIGNMENT)?;
    }
    w.inner.flush()?;
    Ok(w.written)
}

/// Header-level view of a GGUF file.
#[derive(Debug, Clone)]
pub struct GgufSummary {
    pub version: u32,
    pub metadata: Vec<(String, GgufValue)>,
    /// Name, dims and type of each tensor.
    pub tensors: Vec<(String, Vec<u64>, GgmlType)>,
}

impl GgufSummary {
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&GgufValue> {
        self.metadata.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }
}

struct Reader<R> {
    inner: R,
}

impl<R: Read> Reader<R> {
    fn bytes<const N: usize>(&mut self) -> ExportResult<[u8; N]> {
        let mut buf = [0u8; N];
        self.inner.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn u32(&mut self) -> ExportResult<u32> {
        Ok(u32::from_le_bytes(self.bytes()?))
    }

    fn u64(&mut self) -> ExportResult<u64> {
        Ok(u64::from_le_bytes(self.bytes()?))
    }

    fn string(&mut self) -> ExportResult<String> {
        let len = self.u64()?;
        if len > 1 << 24 {
            return Err(ExportError::Format(format!("string of {len} bytes")));
        }
        let mut buf = vec![0u8; len as usize];
        self.inner.read_exact(&mut buf)?;
        String::from_utf8(buf).map_err(|e| ExportError::Format(e.to_string()))
    }

    fn skip_scalar(&mut self, ty: u32) -> ExportResult<()> {
        let width = match ty {
            TYPE_U8 | TYPE_I8 | TYPE_BOOL => 1,
            TYPE_U16 | TYPE_I16 => 2,
            TYPE_U32 | TYPE_I32 | TYPE_F32 => 4,
            TYPE_U64 | TYPE_I64 | TYPE_F64 => 8,
            TYPE_STRING => {
                self.string()?;
                return Ok(());
            }
            other => return Err(ExportError::Format(format!("unknown value type {other}"))),
        };
        std::io::copy(&mut (&mut self.inner).take(width), &mut std::io::sink())?;
        Ok(())
    }

    fn value(&mut self, ty: u32) -> ExportResult<GgufValue> {
        Ok(match ty {
            TYPE_U32 => GgufValue::U32(self.u32()?),
            TYPE_I32 => GgufValue::I32(i32::from_le_bytes(self.bytes()?)),
            TYPE_U64 => GgufValue::U64(self.u64()?),
            TYPE_F32 => GgufValue::F32(f32::from_le_bytes(self.bytes()?)),
            TYPE_BOOL => GgufValue::Bool(self.bytes::<1>()?[0] != 0),
            TYPE_STRING => GgufValue::String(self.string()?),
            TYPE_ARRAY => {
                let elem = self.u32()?;
                let count = self.u64()?;
                match elem {
                    TYPE_STRING => GgufValue::StringArray((0..count).map(|_| self.string()).collect::<ExportResult<_>>()?),
                    TYPE_I32 => GgufValue::I32Array(
                        (0..count)
                            .map(|_| Ok(i32::from_le_bytes(self.bytes()?)))
                            .collect::<ExportResult<_>>()?,
                    ),
                    other => {
                        for _ in 0..count {
                            self.skip_scalar(other)?;
                        }
                        GgufValue::I32Array(Vec::new())
                    }
                }
            }
            other => {
                self.skip_scalar(other)?;
                GgufValue::Bool(false)
            }
        })
    }
}

/// Reads the header, metadata and tensor infos of a GGUF stream.
pub fn read_gguf_summary(input: impl Read) -> ExportResult<GgufSummary> {
    let mut r = Reader { inner: input };
    if r.bytes::<4>()? != GGUF_MAGIC {
        return Err(ExportError::Format("missing GGUF magic".to_string()));
    }
    let version = r.u32()?;
    if version != GGUF_VERSION {
        return Err(ExportError::Format(format!("unsupported version {version}")));
    }
    let tensor_count = r.u64()?;
    let kv_count = r.u64()?;

    let mut metadata = Vec::new();
    for _ in 0..kv_count {
        let key = r.string()?;
        let ty = r.u32()?;
        metadata.push((key, r.value(ty)?));
    }

    let mut tensors = Vec::new();
    for _ in 0..tensor_count {
        let name = r.string()?;
        let n_dims = r.u32()?;
        let dims = (0..n_dims).map(|_| r.u64()).collect::<ExportResult<Vec<_>>>()?;
        let type_id = r.u32()?;
        let ty = GgmlType::from_id(type_id)
            .ok_or_else(|| ExportError::Format(format!("tensor {name} has unsupported type {type_id}")))?;
        let _offset = r.u64()?;
        tensors.push((name, dims, ty));
    }

    Ok(GgufSummary { version, metadata, tensors })
}
