//! Reader for R serialization streams, the format behind `save()` (`.Rdata`,
//! `.rda`) and `saveRDS()` (`.rds`).
//!
//! Only the XDR flavour is decoded, which is what R writes unless told
//! otherwise. Gzip-compressed and uncompressed streams are accepted. The
//! decoder understands enough of the object graph to pull data frames out:
//! atomic vectors, lists, pairlists, symbols, attributes, references and the
//! ALTREP sequences R uses for compact row names. Closures, environments and
//! the like are consumed and kept as opaque values.

use std::fs;
use std::io::Read;
use std::path::Path;

use flate2::read::MultiGzDecoder;
use polars::prelude::*;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum RDataError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0} compressed R files are not supported, re-save with compress = \"gzip\"")]
    UnsupportedCompression(&'static str),
    #[error("unsupported serialization format {0:?}, only XDR is supported")]
    UnsupportedFormat(String),
    #[error("unsupported serialization version {0}")]
    UnsupportedVersion(i32),
    #[error("unsupported R object type {0}")]
    UnsupportedType(u8),
    #[error("malformed R stream: {0}")]
    Malformed(String),
    #[error("no data.frame found")]
    NoDataFrame,
    #[error(transparent)]
    Polars(#[from] PolarsError),
}

type RResult<T> = Result<T, RDataError>;

// SEXP type codes
const NILSXP: u8 = 0;
const SYMSXP: u8 = 1;
const LISTSXP: u8 = 2;
const CLOSXP: u8 = 3;
const ENVSXP: u8 = 4;
const PROMSXP: u8 = 5;
const LANGSXP: u8 = 6;
const SPECIALSXP: u8 = 7;
const BUILTINSXP: u8 = 8;
const CHARSXP: u8 = 9;
const LGLSXP: u8 = 10;
const INTSXP: u8 = 13;
const REALSXP: u8 = 14;
const CPLXSXP: u8 = 15;
const STRSXP: u8 = 16;
const DOTSXP: u8 = 17;
const VECSXP: u8 = 19;
const EXPRSXP: u8 = 20;
const EXTPTRSXP: u8 = 22;
const WEAKREFSXP: u8 = 23;
const RAWSXP: u8 = 24;
const S4SXP: u8 = 25;

// serialization pseudo-types
const ALTREP_SXP: u8 = 238;
const EMPTYENV_SXP: u8 = 242;
const BASEENV_SXP: u8 = 241;
const BASENAMESPACE_SXP: u8 = 250;
const MISSINGARG_SXP: u8 = 251;
const UNBOUNDVALUE_SXP: u8 = 252;
const GLOBALENV_SXP: u8 = 253;
const NILVALUE_SXP: u8 = 254;
const REFSXP: u8 = 255;
const PERSISTSXP: u8 = 247;
const PACKAGESXP: u8 = 248;
const NAMESPACESXP: u8 = 249;

const NA_INTEGER: i32 = i32::MIN;
/// Low word of the NaN payload R uses for `NA_real_`
const NA_REAL_PAYLOAD: u64 = 1954;

/// Decoded R value. Attributes live on the enclosing [`RObject`].
#[derive(Debug, Clone, PartialEq)]
pub enum RValue {
    Null,
    Symbol(String),
    Pairlist(Vec<(Option<String>, RObject)>),
    Logical(Vec<Option<bool>>),
    Integer(Vec<Option<i32>>),
    Real(Vec<Option<f64>>),
    Character(Vec<Option<String>>),
    List(Vec<RObject>),
    Environment,
    /// Something the figure never needs (closures, raw vectors, ...)
    Opaque(u8),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RObject {
    pub value: RValue,
    pub attributes: Vec<(String, RObject)>,
}

impl RObject {
    fn new(value: RValue) -> Self {
        Self { value, attributes: Vec::new() }
    }

    fn null() -> Self {
        Self::new(RValue::Null)
    }

    pub fn attribute(&self, name: &str) -> Option<&RObject> {
        self.attributes.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Values of the `class` attribute, empty when unset.
    pub fn classes(&self) -> Vec<&str> {
        match self.attribute("class").map(|c| &c.value) {
            Some(RValue::Character(values)) => values.iter().flatten().map(String::as_str).collect(),
            _ => Vec::new(),
        }
    }

    pub fn inherits(&self, class: &str) -> bool {
        self.classes().contains(&class)
    }

    pub fn is_data_frame(&self) -> bool {
        matches!(self.value, RValue::List(_)) && self.inherits("data.frame")
    }

    fn take_attributes(value: RObject) -> Vec<(String, RObject)> {
        match value.value {
            RValue::Pairlist(items) => items
                .into_iter()
                .filter_map(|(tag, v)| tag.map(|t| (t, v)))
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// Cursor over a decompressed XDR stream plus the back-reference table.
struct XdrReader<'a> {
    buf: &'a [u8],
    pos: usize,
    refs: Vec<RObject>,
}

impl<'a> XdrReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0, refs: Vec::new() }
    }

    fn take(&mut self, n: usize) -> RResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| {
                RDataError::Malformed(format!("unexpected end of stream at byte {}", self.pos))
            })?;
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn read_int(&mut self) -> RResult<i32> {
        let b = self.take(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_real(&mut self) -> RResult<Option<f64>> {
        let b = self.take(8)?;
        let bits = u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]);
        let value = f64::from_bits(bits);
        if value.is_nan() && bits & 0xFFFF_FFFF == NA_REAL_PAYLOAD {
            Ok(None)
        } else {
            Ok(Some(value))
        }
    }

    fn read_length(&mut self) -> RResult<usize> {
        let len = self.read_int()?;
        let len = match len {
            -1 => {
                let upper = self.read_int()? as u32 as u64;
                let lower = self.read_int()? as u32 as u64;
                (upper << 32) + lower
            }
            n if n < 0 => return Err(RDataError::Malformed(format!("negative length {n}"))),
            n => n as u64,
        };
        // every element takes at least one byte, so longer vectors are corrupt
        let remaining = (self.buf.len() - self.pos) as u64;
        if len > remaining {
            return Err(RDataError::Malformed(format!(
                "vector length {len} exceeds the {remaining} bytes left"
            )));
        }
        Ok(len as usize)
    }

    fn read_string_body(&mut self) -> RResult<Option<String>> {
        let len = self.read_int()?;
        if len == -1 {
            return Ok(None);
        }
        if len < 0 {
            return Err(RDataError::Malformed(format!("negative string length {len}")));
        }
        let bytes = self.take(len as usize)?;
        Ok(Some(String::from_utf8_lossy(bytes).into_owned()))
    }

    /// Strings stored as full items inside STRSXP vectors and symbols.
    fn read_charsxp(&mut self) -> RResult<Option<String>> {
        let flags = self.read_int()? as u32;
        let ty = (flags & 0xFF) as u8;
        if ty != CHARSXP {
            return Err(RDataError::Malformed(format!("expected CHARSXP, found type {ty}")));
        }
        let s = self.read_string_body()?;
        if flags & (1 << 9) != 0 {
            self.read_item()?;
        }
        Ok(s)
    }

    fn read_persistent_strings(&mut self) -> RResult<Vec<Option<String>>> {
        if self.read_int()? != 0 {
            return Err(RDataError::Malformed("bad persistent string header".into()));
        }
        let len = self.read_length()?;
        (0..len).map(|_| self.read_charsxp()).collect()
    }

    fn read_item(&mut self) -> RResult<RObject> {
        let flags = self.read_int()? as u32;
        self.read_item_with_flags(flags)
    }

    fn read_item_with_flags(&mut self, flags: u32) -> RResult<RObject> {
        let ty = (flags & 0xFF) as u8;
        let has_attr = flags & (1 << 9) != 0;
        let has_tag = flags & (1 << 10) != 0;

        match ty {
            NILVALUE_SXP | NILSXP => return Ok(RObject::null()),
            MISSINGARG_SXP | UNBOUNDVALUE_SXP => return Ok(RObject::null()),
            EMPTYENV_SXP | BASEENV_SXP | GLOBALENV_SXP | BASENAMESPACE_SXP => {
                return Ok(RObject::new(RValue::Environment))
            }
            REFSXP => {
                let mut index = (flags >> 8) as usize;
                if index == 0 {
                    index = self.read_int()? as usize;
                }
                return self
                    .refs
                    .get(index.wrapping_sub(1))
                    .cloned()
                    .ok_or_else(|| RDataError::Malformed(format!("dangling reference {index}")));
            }
            PERSISTSXP => {
                self.read_persistent_strings()?;
                self.refs.push(RObject::null());
                return Ok(RObject::null());
            }
            PACKAGESXP | NAMESPACESXP => {
                self.read_persistent_strings()?;
                let env = RObject::new(RValue::Environment);
                self.refs.push(env.clone());
                return Ok(env);
            }
            SYMSXP => {
                let name = self.read_charsxp()?.unwrap_or_default();
                let symbol = RObject::new(RValue::Symbol(name));
                self.refs.push(symbol.clone());
                return Ok(symbol);
            }
            ENVSXP => {
                let _locked = self.read_int()?;
                let env = RObject::new(RValue::Environment);
                self.refs.push(env.clone());
                // enclosure, frame, hash table, attributes
                for _ in 0..4 {
                    self.read_item()?;
                }
                return Ok(env);
            }
            LISTSXP => return self.read_pairlist(flags),
            LANGSXP | CLOSXP | PROMSXP | DOTSXP => {
                if has_attr {
                    self.read_item()?;
                }
                if has_tag {
                    self.read_item()?;
                }
                self.read_item()?;
                self.read_item()?;
                return Ok(RObject::new(RValue::Opaque(ty)));
            }
            ALTREP_SXP => return self.read_altrep(),
            _ => {}
        }

        let value = match ty {
            CHARSXP => RValue::Character(vec![self.read_string_body()?]),
            LGLSXP => {
                let len = self.read_length()?;
                let mut values = Vec::with_capacity(len);
                for _ in 0..len {
                    let v = self.read_int()?;
                    values.push((v != NA_INTEGER).then_some(v != 0));
                }
                RValue::Logical(values)
            }
            INTSXP => {
                let len = self.read_length()?;
                let mut values = Vec::with_capacity(len);
                for _ in 0..len {
                    let v = self.read_int()?;
                    values.push((v != NA_INTEGER).then_some(v));
                }
                RValue::Integer(values)
            }
            REALSXP => {
                let len = self.read_length()?;
                let mut values = Vec::with_capacity(len);
                for _ in 0..len {
                    values.push(self.read_real()?);
                }
                RValue::Real(values)
            }
            CPLXSXP => {
                let len = self.read_length()?;
                self.take(len * 16)?;
                RValue::Opaque(ty)
            }
            STRSXP => {
                let len = self.read_length()?;
                let mut values = Vec::with_capacity(len);
                for _ in 0..len {
                    values.push(self.read_charsxp()?);
                }
                RValue::Character(values)
            }
            VECSXP | EXPRSXP => {
                let len = self.read_length()?;
                let mut items = Vec::with_capacity(len);
                for _ in 0..len {
                    items.push(self.read_item()?);
                }
                RValue::List(items)
            }
            RAWSXP => {
                let len = self.read_length()?;
                self.take(len)?;
                RValue::Opaque(ty)
            }
            SPECIALSXP | BUILTINSXP => {
                let len = self.read_int()?;
                self.take(len.max(0) as usize)?;
                RValue::Opaque(ty)
            }
            S4SXP => RValue::Opaque(ty),
            EXTPTRSXP => {
                self.refs.push(RObject::new(RValue::Opaque(ty)));
                // protected value and tag
                self.read_item()?;
                self.read_item()?;
                RValue::Opaque(ty)
            }
            WEAKREFSXP => {
                self.refs.push(RObject::new(RValue::Opaque(ty)));
                RValue::Opaque(ty)
            }
            other => return Err(RDataError::UnsupportedType(other)),
        };

        let mut object = RObject::new(value);
        if has_attr {
            let attributes = self.read_item()?;
            if ty != CHARSXP {
                object.attributes = RObject::take_attributes(attributes);
            }
        }
        Ok(object)
    }

    /// Pairlists are written as a chain of cells; walk the chain instead of
    /// recursing on every CDR.
    fn read_pairlist(&mut self, first_flags: u32) -> RResult<RObject> {
        let mut items = Vec::new();
        let mut attributes = Vec::new();
        let mut flags = first_flags;

        loop {
            if flags & (1 << 9) != 0 {
                let attr = self.read_item()?;
                if items.is_empty() {
                    attributes = RObject::take_attributes(attr);
                }
            }
            let tag = if flags & (1 << 10) != 0 {
                match self.read_item()?.value {
                    RValue::Symbol(name) => Some(name),
                    RValue::Character(mut names) if names.len() == 1 => names.remove(0),
                    _ => None,
                }
            } else {
                None
            };
            let car = self.read_item()?;
            items.push((tag, car));

            flags = self.read_int()? as u32;
            let ty = (flags & 0xFF) as u8;
            if ty == LISTSXP {
                continue;
            }
            // a dotted pair ends on something other than NULL; keep it as a last element
            let tail = self.read_item_with_flags(flags)?;
            if tail.value != RValue::Null {
                items.push((None, tail));
            }
            break;
        }

        Ok(RObject { value: RValue::Pairlist(items), attributes })
    }

    fn read_altrep(&mut self) -> RResult<RObject> {
        let info = self.read_item()?;
        let state = self.read_item()?;
        let attr = self.read_item()?;

        let class = match &info.value {
            RValue::Pairlist(items) => match items.first().map(|(_, v)| &v.value) {
                Some(RValue::Symbol(name)) => name.clone(),
                _ => String::new(),
            },
            _ => String::new(),
        };

        let value = match class.as_str() {
            "compact_intseq" => {
                let (n, start, step) = sequence_state(&state)?;
                RValue::Integer((0..n).map(|i| Some((start + step * i as f64) as i32)).collect())
            }
            "compact_realseq" => {
                let (n, start, step) = sequence_state(&state)?;
                RValue::Real((0..n).map(|i| Some(start + step * i as f64)).collect())
            }
            wrapper if wrapper.starts_with("wrap_") => match state.value {
                RValue::List(mut parts) if !parts.is_empty() => {
                    let wrapped = parts.remove(0);
                    // wrapped objects carry their attributes on the payload
                    let mut object = RObject::new(wrapped.value);
                    object.attributes = wrapped.attributes;
                    object.attributes.extend(RObject::take_attributes(attr));
                    return Ok(object);
                }
                _ => return Err(RDataError::Malformed(format!("bad {wrapper} state"))),
            },
            "deferred_string" => deferred_strings(&state),
            other => {
                warn!("Unknown ALTREP class '{}', keeping it opaque", other);
                RValue::Opaque(ALTREP_SXP)
            }
        };

        let mut object = RObject::new(value);
        object.attributes = RObject::take_attributes(attr);
        Ok(object)
    }
}

fn sequence_state(state: &RObject) -> RResult<(usize, f64, f64)> {
    match &state.value {
        RValue::Real(values) if values.len() == 3 => {
            let n = values[0].unwrap_or(0.0);
            let start = values[1].unwrap_or(0.0);
            let step = values[2].unwrap_or(1.0);
            Ok((n.max(0.0) as usize, start, step))
        }
        RValue::Integer(values) if values.len() == 3 => {
            let n = values[0].unwrap_or(0);
            let start = values[1].unwrap_or(0);
            let step = values[2].unwrap_or(1);
            Ok((n.max(0) as usize, start as f64, step as f64))
        }
        _ => Err(RDataError::Malformed("bad compact sequence state".into())),
    }
}

/// Deferred strings keep the numeric vector they will be formatted from.
fn deferred_strings(state: &RObject) -> RValue {
    let source = match &state.value {
        RValue::Pairlist(items) => items.first().map(|(_, v)| &v.value),
        other => Some(other),
    };
    match source {
        Some(RValue::Integer(values)) => {
            RValue::Character(values.iter().map(|v| v.map(|i| i.to_string())).collect())
        }
        Some(RValue::Real(values)) => {
            RValue::Character(values.iter().map(|v| v.map(|x| x.to_string())).collect())
        }
        _ => RValue::Opaque(ALTREP_SXP),
    }
}

fn decompress(raw: Vec<u8>) -> RResult<Vec<u8>> {
    if raw.starts_with(&[0x1f, 0x8b]) {
        let mut out = Vec::with_capacity(raw.len() * 4);
        MultiGzDecoder::new(raw.as_slice()).read_to_end(&mut out)?;
        Ok(out)
    } else if raw.starts_with(b"BZh") {
        Err(RDataError::UnsupportedCompression("bzip2"))
    } else if raw.starts_with(&[0xfd, b'7', b'z', b'X', b'Z', 0x00]) {
        Err(RDataError::UnsupportedCompression("xz"))
    } else {
        Ok(raw)
    }
}

/// Decode a serialization stream into its top-level objects.
///
/// `.Rdata` containers yield one entry per saved variable; a bare `.rds`
/// stream yields a single unnamed entry.
pub fn parse_rdata(raw: Vec<u8>) -> RResult<Vec<(Option<String>, RObject)>> {
    let bytes = decompress(raw)?;
    let mut body: &[u8] = &bytes;

    let container = match body.get(..5) {
        Some(b"RDX2\n") | Some(b"RDX3\n") => {
            body = &body[5..];
            true
        }
        Some(magic @ (b"RDA2\n" | b"RDA3\n" | b"RDB2\n" | b"RDB3\n")) => {
            return Err(RDataError::UnsupportedFormat(
                String::from_utf8_lossy(magic).trim().to_string(),
            ))
        }
        _ => false,
    };

    match body.get(..2) {
        Some(b"X\n") => body = &body[2..],
        Some(other) => {
            return Err(RDataError::UnsupportedFormat(
                String::from_utf8_lossy(other).trim().to_string(),
            ))
        }
        None => return Err(RDataError::Malformed("stream is too short".into())),
    }

    let mut reader = XdrReader::new(body);
    let version = reader.read_int()?;
    let _writer_version = reader.read_int()?;
    let _min_reader_version = reader.read_int()?;
    match version {
        2 => {}
        3 => {
            let encoding_len = reader.read_int()?;
            let encoding = reader.take(encoding_len.max(0) as usize)?;
            debug!("Native encoding: {}", String::from_utf8_lossy(encoding));
        }
        v => return Err(RDataError::UnsupportedVersion(v)),
    }

    let top = reader.read_item()?;
    if container {
        match top.value {
            RValue::Pairlist(items) => Ok(items),
            RValue::Null => Ok(Vec::new()),
            _ => Err(RDataError::Malformed("container does not hold a pairlist".into())),
        }
    } else {
        Ok(vec![(None, top)])
    }
}

pub fn read_rdata(path: &Path) -> RResult<Vec<(Option<String>, RObject)>> {
    let raw = fs::read(path)?;
    parse_rdata(raw)
}

fn factor_labels(codes: &[Option<i32>], levels: &RObject) -> RResult<Vec<Option<String>>> {
    let RValue::Character(levels) = &levels.value else {
        return Err(RDataError::Malformed("factor levels are not strings".into()));
    };
    Ok(codes
        .iter()
        .map(|code| {
            code.and_then(|c| usize::try_from(c - 1).ok())
                .and_then(|i| levels.get(i).cloned().flatten())
        })
        .collect())
}

/// Turn an R `data.frame` into a polars `DataFrame`. Columns polars cannot
/// hold (list columns, complex numbers) are skipped.
pub fn data_frame_from_r(object: &RObject) -> RResult<DataFrame> {
    let RValue::List(columns) = &object.value else {
        return Err(RDataError::NoDataFrame);
    };
    let names: Vec<String> = match object.attribute("names").map(|n| &n.value) {
        Some(RValue::Character(names)) => names
            .iter()
            .enumerate()
            .map(|(i, n)| n.clone().unwrap_or_else(|| format!("V{}", i + 1)))
            .collect(),
        _ => (1..=columns.len()).map(|i| format!("V{i}")).collect(),
    };

    let mut out = Vec::with_capacity(columns.len());
    for (name, column) in names.iter().zip(columns) {
        let name = PlSmallStr::from(name.as_str());
        let series = match &column.value {
            RValue::Integer(codes) if column.inherits("factor") => {
                let levels = column
                    .attribute("levels")
                    .ok_or_else(|| RDataError::Malformed(format!("factor {name} has no levels")))?;
                Series::new(name, factor_labels(codes, levels)?)
            }
            RValue::Real(values) => Series::new(name, values),
            RValue::Integer(values) => Series::new(name, values),
            RValue::Logical(values) => Series::new(name, values),
            RValue::Character(values) => Series::new(name, values),
            other => {
                warn!("Skipping column '{}' with unsupported content {:?}", name, type_name(other));
                continue;
            }
        };
        out.push(Column::from(series));
    }

    Ok(DataFrame::new(out)?)
}

fn type_name(value: &RValue) -> &'static str {
    match value {
        RValue::Null => "NULL",
        RValue::Symbol(_) => "symbol",
        RValue::Pairlist(_) => "pairlist",
        RValue::Logical(_) => "logical",
        RValue::Integer(_) => "integer",
        RValue::Real(_) => "double",
        RValue::Character(_) => "character",
        RValue::List(_) => "list",
        RValue::Environment => "environment",
        RValue::Opaque(_) => "opaque",
    }
}

/// First data frame among the decoded objects, with the name it was saved
/// under (`None` for `.rds` streams).
pub fn first_data_frame(objects: &[(Option<String>, RObject)]) -> RResult<(Option<String>, DataFrame)> {
    let (name, object) = objects
        .iter()
        .find(|(_, object)| object.is_data_frame())
        .ok_or(RDataError::NoDataFrame)?;
    Ok((name.clone(), data_frame_from_r(object)?))
}
