#![forbid(unsafe_code)]

use core::fmt;

use ncv_ndarray::{ElementType, ShapeError, Tensor, TensorData, element_count};

pub const NPY_MAGIC_PREFIX: [u8; 6] = [0x93, b'N', b'U', b'M', b'P', b'Y'];
pub const MAX_HEADER_BYTES: usize = 65_536;
pub const MAX_TENSOR_RANK: usize = 32;

pub const KMODEL_VERSION: u32 = 3;
pub const KMODEL_HEADER_BYTES: usize = 8 * 4;
pub const KMODEL_FLAG_WEIGHTS_8BIT: u32 = 1;

pub const IO_REASON_CODES: [&str; 7] = [
    "io_magic_invalid",
    "io_header_schema_invalid",
    "io_dtype_descriptor_invalid",
    "io_write_contract_violation",
    "io_read_payload_incomplete",
    "io_dataset_format_unknown",
    "io_kmodel_invalid",
];

const NPY_HEADER_REQUIRED_KEYS: [&str; 3] = ["descr", "fortran_order", "shape"];

/// How a staged tensor file is encoded on disk.
///
/// `Raw` is the bare little-endian element payload; readers must already know
/// the shape and element type. `Npy` carries both in its header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DatasetFormat {
    #[default]
    Raw,
    Npy,
}

impl DatasetFormat {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Npy => "npy",
        }
    }

    #[must_use]
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Raw => "bin",
            Self::Npy => "npy",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, IOError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "raw" => Ok(Self::Raw),
            "npy" => Ok(Self::Npy),
            _ => Err(IOError::DatasetFormatUnknown(raw.trim().to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NpyDType {
    U8,
    F32,
}

impl NpyDType {
    #[must_use]
    pub const fn descr(self) -> &'static str {
        match self {
            Self::U8 => "|u1",
            Self::F32 => "<f4",
        }
    }

    pub fn decode(descr: &str) -> Result<Self, IOError> {
        match descr {
            "|u1" | "<u1" => Ok(Self::U8),
            "<f4" => Ok(Self::F32),
            _ => Err(IOError::DTypeDescriptorInvalid(descr.to_string())),
        }
    }

    #[must_use]
    pub const fn element_type(self) -> ElementType {
        match self {
            Self::U8 => ElementType::U8,
            Self::F32 => ElementType::F32,
        }
    }

    #[must_use]
    pub const fn from_element_type(element_type: ElementType) -> Self {
        match element_type {
            ElementType::U8 => Self::U8,
            ElementType::F32 => Self::F32,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IOError {
    MagicInvalid,
    HeaderSchemaInvalid(&'static str),
    DTypeDescriptorInvalid(String),
    WriteContractViolation(&'static str),
    ReadPayloadIncomplete { expected_bytes: usize, actual_bytes: usize },
    DatasetFormatUnknown(String),
    KModelInvalid(&'static str),
}

impl IOError {
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::MagicInvalid => "io_magic_invalid",
            Self::HeaderSchemaInvalid(_) => "io_header_schema_invalid",
            Self::DTypeDescriptorInvalid(_) => "io_dtype_descriptor_invalid",
            Self::WriteContractViolation(_) => "io_write_contract_violation",
            Self::ReadPayloadIncomplete { .. } => "io_read_payload_incomplete",
            Self::DatasetFormatUnknown(_) => "io_dataset_format_unknown",
            Self::KModelInvalid(_) => "io_kmodel_invalid",
        }
    }
}

impl fmt::Display for IOError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MagicInvalid => write!(f, "invalid or unsupported npy magic/version"),
            Self::HeaderSchemaInvalid(msg) => write!(f, "{msg}"),
            Self::DTypeDescriptorInvalid(descr) => {
                write!(f, "dtype descriptor '{descr}' is invalid or unsupported")
            }
            Self::WriteContractViolation(msg) => write!(f, "{msg}"),
            Self::ReadPayloadIncomplete {
                expected_bytes,
                actual_bytes,
            } => write!(
                f,
                "payload bytes must match shape/dtype footprint expected={expected_bytes} actual={actual_bytes}"
            ),
            Self::DatasetFormatUnknown(raw) => write!(f, "unknown dataset format '{raw}'"),
            Self::KModelInvalid(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for IOError {}

impl From<ShapeError> for IOError {
    fn from(_: ShapeError) -> Self {
        Self::HeaderSchemaInvalid("shape element-count overflowed")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NpyHeader {
    pub shape: Vec<usize>,
    pub descr: NpyDType,
}

// ── tensor payloads ────────

#[must_use]
pub fn tensor_payload_bytes(tensor: &Tensor) -> Vec<u8> {
    match tensor.data() {
        TensorData::F32(values) => values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        TensorData::U8(values) => values.clone(),
    }
}

fn payload_to_data(payload: &[u8], element_type: ElementType) -> TensorData {
    match element_type {
        ElementType::F32 => TensorData::F32(
            payload
                .chunks_exact(4)
                .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                .collect(),
        ),
        ElementType::U8 => TensorData::U8(payload.to_vec()),
    }
}

pub fn validate_read_payload(
    shape: &[usize],
    payload_len_bytes: usize,
    element_type: ElementType,
) -> Result<usize, IOError> {
    let expected_count = element_count(shape)?;
    let expected_bytes = expected_count
        .checked_mul(element_type.item_size())
        .ok_or(IOError::HeaderSchemaInvalid("expected payload bytes overflowed"))?;
    if payload_len_bytes != expected_bytes {
        return Err(IOError::ReadPayloadIncomplete {
            expected_bytes,
            actual_bytes: payload_len_bytes,
        });
    }
    Ok(expected_count)
}

#[must_use]
pub fn encode_raw(tensor: &Tensor) -> Vec<u8> {
    tensor_payload_bytes(tensor)
}

pub fn decode_raw(
    payload: &[u8],
    shape: &[usize],
    element_type: ElementType,
) -> Result<Tensor, IOError> {
    let _ = validate_read_payload(shape, payload.len(), element_type)?;
    Tensor::new(shape.to_vec(), payload_to_data(payload, element_type)).map_err(IOError::from)
}

/// Decodes a raw payload whose shape is unknown as a rank-1 tensor.
pub fn decode_raw_flat(payload: &[u8], element_type: ElementType) -> Result<Tensor, IOError> {
    let item_size = element_type.item_size();
    if !payload.len().is_multiple_of(item_size) {
        return Err(IOError::ReadPayloadIncomplete {
            expected_bytes: payload.len() - payload.len() % item_size,
            actual_bytes: payload.len(),
        });
    }
    decode_raw(payload, &[payload.len() / item_size], element_type)
}

pub fn encode_tensor(tensor: &Tensor, format: DatasetFormat) -> Result<Vec<u8>, IOError> {
    match format {
        DatasetFormat::Raw => Ok(encode_raw(tensor)),
        DatasetFormat::Npy => write_npy_tensor(tensor),
    }
}

/// Decodes a staged tensor file. `raw_shape` is only consulted for the
/// headerless `raw` format.
pub fn decode_tensor(
    payload: &[u8],
    format: DatasetFormat,
    raw_shape: &[usize],
    raw_element_type: ElementType,
) -> Result<Tensor, IOError> {
    match format {
        DatasetFormat::Raw => decode_raw(payload, raw_shape, raw_element_type),
        DatasetFormat::Npy => read_npy_tensor(payload),
    }
}

// ── npy header codec ────────

fn format_shape_tuple(shape: &[usize]) -> String {
    match shape {
        [] => "()".to_string(),
        [single] => format!("({single},)"),
        _ => {
            let joined = shape
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            format!("({joined})")
        }
    }
}

fn encode_header_bytes(header: &NpyHeader) -> Result<Vec<u8>, IOError> {
    let dictionary = format!(
        "{{'descr': '{}', 'fortran_order': False, 'shape': {}, }}",
        header.descr.descr(),
        format_shape_tuple(&header.shape)
    );
    // magic + version + u16 length, then the dictionary padded so the
    // payload starts on a 64-byte boundary, newline-terminated
    let prefix_len = NPY_MAGIC_PREFIX.len() + 2 + 2;
    let unpadded = prefix_len + dictionary.len() + 1;
    let padding = (64 - unpadded % 64) % 64;
    let header_len = dictionary.len() + padding + 1;
    if header_len > MAX_HEADER_BYTES || header_len > usize::from(u16::MAX) {
        return Err(IOError::HeaderSchemaInvalid(
            "header bytes must be within bounded budget",
        ));
    }

    let mut bytes = Vec::with_capacity(header_len);
    bytes.extend_from_slice(dictionary.as_bytes());
    bytes.extend(std::iter::repeat_n(b' ', padding));
    bytes.push(b'\n');
    Ok(bytes)
}

pub fn write_npy_bytes(header: &NpyHeader, payload: &[u8]) -> Result<Vec<u8>, IOError> {
    if header.shape.len() > MAX_TENSOR_RANK {
        return Err(IOError::WriteContractViolation(
            "shape rank exceeds supported budget",
        ));
    }
    let element_type = header.descr.element_type();
    if validate_read_payload(&header.shape, payload.len(), element_type).is_err() {
        return Err(IOError::WriteContractViolation(
            "payload bytes do not match shape element count",
        ));
    }

    let header_bytes = encode_header_bytes(header)?;
    let header_len = u16::try_from(header_bytes.len())
        .map_err(|_| IOError::HeaderSchemaInvalid("header length exceeds u16 boundary"))?;

    let mut encoded = Vec::with_capacity(10 + header_bytes.len() + payload.len());
    encoded.extend_from_slice(&NPY_MAGIC_PREFIX);
    encoded.extend_from_slice(&[1, 0]);
    encoded.extend_from_slice(&header_len.to_le_bytes());
    encoded.extend_from_slice(&header_bytes);
    encoded.extend_from_slice(payload);
    Ok(encoded)
}

pub fn write_npy_tensor(tensor: &Tensor) -> Result<Vec<u8>, IOError> {
    let header = NpyHeader {
        shape: tensor.shape().to_vec(),
        descr: NpyDType::from_element_type(tensor.element_type()),
    };
    write_npy_bytes(&header, &tensor_payload_bytes(tensor))
}

pub fn validate_magic_version(payload: &[u8]) -> Result<(u8, u8), IOError> {
    if payload.len() < 8 || payload[..6] != NPY_MAGIC_PREFIX {
        return Err(IOError::MagicInvalid);
    }
    match (payload[6], payload[7]) {
        version @ ((1, 0) | (2, 0) | (3, 0)) => Ok(version),
        _ => Err(IOError::MagicInvalid),
    }
}

fn read_header_span(payload: &[u8], version: (u8, u8)) -> Result<(usize, usize), IOError> {
    let (offset, header_len) = if version == (1, 0) {
        let field = payload
            .get(8..10)
            .ok_or(IOError::HeaderSchemaInvalid(
                "payload truncated before header length field",
            ))?;
        (10, usize::from(u16::from_le_bytes([field[0], field[1]])))
    } else {
        let field = payload
            .get(8..12)
            .ok_or(IOError::HeaderSchemaInvalid(
                "payload truncated before header length field",
            ))?;
        let raw = u32::from_le_bytes([field[0], field[1], field[2], field[3]]);
        let len = usize::try_from(raw)
            .map_err(|_| IOError::HeaderSchemaInvalid("header length exceeds usize"))?;
        (12, len)
    };

    if header_len == 0 || header_len > MAX_HEADER_BYTES {
        return Err(IOError::HeaderSchemaInvalid(
            "header bytes must be within bounded budget",
        ));
    }
    if payload.len() < offset + header_len {
        return Err(IOError::HeaderSchemaInvalid(
            "payload truncated before declared header bytes",
        ));
    }
    Ok((offset, header_len))
}

fn value_after_key<'a>(dictionary: &'a str, key: &str) -> Result<&'a str, IOError> {
    let quoted = [format!("'{key}'"), format!("\"{key}\"")];
    let (start, len) = quoted
        .iter()
        .find_map(|needle| dictionary.find(needle.as_str()).map(|at| (at, needle.len())))
        .ok_or(IOError::HeaderSchemaInvalid(
            "required header field is missing",
        ))?;
    dictionary[start + len..]
        .trim_start()
        .strip_prefix(':')
        .map(str::trim_start)
        .ok_or(IOError::HeaderSchemaInvalid(
            "header field is missing ':' separator",
        ))
}

fn quoted_value(value: &str) -> Result<&str, IOError> {
    let quote = value
        .chars()
        .next()
        .filter(|c| *c == '\'' || *c == '"')
        .ok_or(IOError::HeaderSchemaInvalid(
            "header quoted value must start with quote",
        ))?;
    let tail = &value[1..];
    let end = tail.find(quote).ok_or(IOError::HeaderSchemaInvalid(
        "header quoted value missing closing quote",
    ))?;
    Ok(&tail[..end])
}

fn parse_shape_tuple(value: &str) -> Result<Vec<usize>, IOError> {
    let inner = value
        .strip_prefix('(')
        .and_then(|rest| rest.find(')').map(|end| &rest[..end]))
        .ok_or(IOError::HeaderSchemaInvalid(
            "shape field must be a tuple literal",
        ))?;

    let dims = inner
        .split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(|token| {
            token
                .parse::<usize>()
                .map_err(|_| IOError::HeaderSchemaInvalid("shape tuple entries must be usize"))
        })
        .collect::<Result<Vec<_>, _>>()?;

    if dims.len() == 1 && !inner.contains(',') {
        return Err(IOError::HeaderSchemaInvalid(
            "singleton shape tuples must include trailing comma",
        ));
    }
    Ok(dims)
}

fn count_header_keys(dictionary: &str) -> usize {
    dictionary
        .split(',')
        .filter(|entry| {
            let entry = entry.trim_start_matches(['{', ' ']);
            NPY_HEADER_REQUIRED_KEYS.iter().any(|key| {
                entry.starts_with(&format!("'{key}'")) || entry.starts_with(&format!("\"{key}\""))
            })
        })
        .count()
}

fn parse_header_dictionary(header_bytes: &[u8]) -> Result<NpyHeader, IOError> {
    let dictionary = std::str::from_utf8(header_bytes)
        .map_err(|_| IOError::HeaderSchemaInvalid("header bytes must decode as ascii"))?
        .trim_end();
    if !(dictionary.starts_with('{') && dictionary.ends_with('}')) {
        return Err(IOError::HeaderSchemaInvalid(
            "header dictionary must be wrapped in braces",
        ));
    }
    if count_header_keys(dictionary) != NPY_HEADER_REQUIRED_KEYS.len() {
        return Err(IOError::HeaderSchemaInvalid(
            "header dictionary must contain exactly descr/fortran_order/shape keys",
        ));
    }

    let descr = NpyDType::decode(quoted_value(value_after_key(dictionary, "descr")?)?)?;

    let fortran = value_after_key(dictionary, "fortran_order")?;
    if fortran.starts_with("True") {
        return Err(IOError::HeaderSchemaInvalid(
            "fortran-ordered payloads are not supported",
        ));
    }
    if !fortran.starts_with("False") {
        return Err(IOError::HeaderSchemaInvalid(
            "fortran_order field must be True or False",
        ));
    }

    let shape = parse_shape_tuple(value_after_key(dictionary, "shape")?)?;
    if shape.len() > MAX_TENSOR_RANK {
        return Err(IOError::HeaderSchemaInvalid(
            "shape rank exceeds supported budget",
        ));
    }
    let _ = element_count(&shape)?;
    Ok(NpyHeader { shape, descr })
}

pub fn read_npy_bytes(payload: &[u8]) -> Result<(NpyHeader, &[u8]), IOError> {
    let version = validate_magic_version(payload)?;
    let (offset, header_len) = read_header_span(payload, version)?;
    let header = parse_header_dictionary(&payload[offset..offset + header_len])?;
    let body = &payload[offset + header_len..];
    let _ = validate_read_payload(&header.shape, body.len(), header.descr.element_type())?;
    Ok((header, body))
}

pub fn read_npy_tensor(payload: &[u8]) -> Result<Tensor, IOError> {
    let (header, body) = read_npy_bytes(payload)?;
    let element_type = header.descr.element_type();
    Tensor::new(header.shape, payload_to_data(body, element_type)).map_err(IOError::from)
}

// ── compiled artifact inspection ────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KModelLayer {
    pub layer_type: u32,
    pub body_size: u32,
}

/// Header of a K210 `kmodel` (version 3) as written by the compiler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KModelSummary {
    pub version: u32,
    pub flags: u32,
    pub arch: u32,
    pub max_start_address: u32,
    pub main_mem_usage: u32,
    pub main_mem_output_address: u32,
    pub main_mem_output_size: u32,
    pub layers: Vec<KModelLayer>,
}

impl KModelSummary {
    #[must_use]
    pub const fn weights_bits(&self) -> u32 {
        if self.flags & KMODEL_FLAG_WEIGHTS_8BIT != 0 {
            8
        } else {
            16
        }
    }

    #[must_use]
    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }
}

fn read_u32_le(bytes: &[u8], word: usize) -> Option<u32> {
    let start = word.checked_mul(4)?;
    let chunk = bytes.get(start..start + 4)?;
    Some(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
}

pub fn inspect_kmodel(bytes: &[u8]) -> Result<KModelSummary, IOError> {
    let word = |idx: usize| {
        read_u32_le(bytes, idx).ok_or(IOError::KModelInvalid(
            "kmodel truncated before end of header",
        ))
    };

    let version = word(0)?;
    if version != KMODEL_VERSION {
        return Err(IOError::KModelInvalid("unsupported kmodel version"));
    }
    let layers_count = usize::try_from(word(3)?)
        .map_err(|_| IOError::KModelInvalid("kmodel layer count exceeds usize"))?;

    let table_words = layers_count
        .checked_mul(2)
        .ok_or(IOError::KModelInvalid("kmodel layer table overflowed"))?;
    if bytes.len() < KMODEL_HEADER_BYTES + table_words.saturating_mul(4) {
        return Err(IOError::KModelInvalid(
            "kmodel truncated before end of layer table",
        ));
    }

    let mut layers = Vec::with_capacity(layers_count);
    let mut body_total = 0usize;
    for idx in 0..layers_count {
        let base = KMODEL_HEADER_BYTES / 4 + idx * 2;
        let layer = KModelLayer {
            layer_type: word(base)?,
            body_size: word(base + 1)?,
        };
        body_total = body_total
            .checked_add(layer.body_size as usize)
            .ok_or(IOError::KModelInvalid("kmodel layer bodies overflowed"))?;
        layers.push(layer);
    }

    if KMODEL_HEADER_BYTES + table_words * 4 + body_total > bytes.len() {
        return Err(IOError::KModelInvalid(
            "kmodel layer bodies exceed artifact size",
        ));
    }

    Ok(KModelSummary {
        version,
        flags: word(1)?,
        arch: word(2)?,
        max_start_address: word(4)?,
        main_mem_usage: word(5)?,
        main_mem_output_address: word(6)?,
        main_mem_output_size: word(7)?,
        layers,
    })
}
