use core::error::Error;
use std::fs::File;
use std::io::BufRead;
use std::io::BufReader;
use std::io::BufWriter;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use glam::DVec3;
use log::debug;
use log::info;

use crate::PointCloud;
use crate::error::CloudError;

/// Width reserved for the vertex count in the headers this crate writes.
///
/// A fixed width lets [`PlyStreamWriter`] patch the count in place.
const COUNT_WIDTH: usize = 20;

const NPY_MAGIC: &[u8] = b"\x93NUMPY";

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> CloudError + '_ {
    move |source| CloudError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn parse_error(path: &Path, line: usize, message: impl Into<String>) -> CloudError {
    CloudError::Parse {
        path: path.to_path_buf(),
        line,
        message: message.into(),
    }
}

/// Return a point cloud stored in file, choosing the reader by extension.
///
/// `.ply` is read by [`load_ply`], `.xyz`, `.txt` and `.pts` by [`load_xyz`].
///
/// # Errors
///   When the extension is unknown or the reader fails.
pub fn load_cloud(path: &Path) -> Result<PointCloud, CloudError> {
    let extension = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase());
    let cloud = match extension.as_deref() {
        Some("ply") => load_ply(path)?,
        Some("xyz" | "txt" | "pts") => load_xyz(path)?,
        _ => {
            return Err(CloudError::UnknownFormat {
                path: path.to_path_buf(),
            });
        }
    };
    info!("loaded {} points from {}", cloud.len(), path.display());
    Ok(cloud)
}

/// Return a point cloud stored in a whitespace delimited text file.
///
/// The first three columns are x, y and z. Further columns are kept as
/// attributes named `column_3`, `column_4`, ... and must be present on every
/// line. Blank lines and lines starting with `#` are skipped.
///
/// # Errors
///   If the file cannot be opened, or a line is short or unparseable.
pub fn load_xyz(path: &Path) -> Result<PointCloud, CloudError> {
    let file = File::open(path).map_err(io_error(path))?;
    let reader = BufReader::new(file);

    let mut points = Vec::new();
    let mut extra: Vec<Vec<f64>> = Vec::new();
    let mut columns = None;

    for (n, line) in reader.lines().enumerate() {
        let line_no = n + 1;
        let line = line.map_err(io_error(path))?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let values = line
            .split_whitespace()
            .map(str::parse::<f64>)
            .collect::<Result<Vec<f64>, _>>()
            .map_err(|e| parse_error(path, line_no, e.to_string()))?;

        if values.len() < 3 {
            return Err(parse_error(
                path,
                line_no,
                format!("expected at least 3 columns, found {}", values.len()),
            ));
        }
        let expected = *columns.get_or_insert(values.len());
        if values.len() != expected {
            return Err(parse_error(
                path,
                line_no,
                format!("expected {expected} columns, found {}", values.len()),
            ));
        }

        let p = DVec3::new(values[0], values[1], values[2]);
        if !p.is_finite() {
            return Err(parse_error(path, line_no, "non-finite coordinate"));
        }
        points.push(p);

        extra.resize_with(expected - 3, Vec::new);
        for (column, value) in extra.iter_mut().zip(&values[3..]) {
            column.push(*value);
        }
    }

    let mut cloud = PointCloud::new(points)?;
    for (i, column) in extra.into_iter().enumerate() {
        cloud = cloud.with_attribute(format!("column_{}", i + 3), column)?;
    }
    Ok(cloud)
}

/// Write points in the cell file format.
///
/// One point per line, `x y z` with six decimals and a single space, no
/// header. This is the exact input format of the completion network.
///
/// # Errors
///   Problems writing to file.
pub fn save_cell(path: &Path, points: &[DVec3]) -> std::io::Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    for p in points {
        writeln!(writer, "{:.6} {:.6} {:.6}", p.x, p.y, p.z)?;
    }
    writer.flush()
}

/// Return the points of a cell file.
///
/// # Errors
///   See [`load_xyz`].
pub fn load_cell(path: &Path) -> Result<Vec<DVec3>, CloudError> {
    Ok(load_xyz(path)?.into_points())
}

/// Write Point cloud to file.
///
/// Binary little endian PLY with double precision x, y, z.
///
/// # Errors
///   Problems writing to file.
pub fn save_points(path: &Path, points: &[DVec3]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    write_ply_header(&mut writer, points.len() as u64)?;
    write_le_doubles(&mut writer, points)?;
    writer.flush()
}

// Returns the byte offset of the vertex count.
fn write_ply_header<W: Write>(writer: &mut W, count: u64) -> std::io::Result<u64> {
    let preamble = "ply\nformat binary_little_endian 1.0\nelement vertex ";
    writer.write_all(preamble.as_bytes())?;
    writeln!(writer, "{count:<COUNT_WIDTH$}")?;
    writeln!(writer, "property double x")?;
    writeln!(writer, "property double y")?;
    writeln!(writer, "property double z")?;
    writeln!(writer, "end_header")?;
    Ok(preamble.len() as u64)
}

fn write_le_doubles<W: Write>(writer: &mut W, points: &[DVec3]) -> std::io::Result<()> {
    let mut buffer: Vec<u8> = Vec::with_capacity(points.len() * 24);
    for point in points {
        for v in point.to_array() {
            buffer.extend_from_slice(&v.to_le_bytes());
        }
    }
    writer.write_all(&buffer)
}

/// Appends points to a PLY file without holding them in memory.
///
/// The header is written up front with a placeholder count which
/// [`PlyStreamWriter::finish`] overwrites. The finished file is byte for byte
/// what [`save_points`] writes for the same points.
#[derive(Debug)]
pub struct PlyStreamWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    count: u64,
    count_offset: u64,
}

impl PlyStreamWriter {
    /// Creates the file, and any missing parent directory.
    ///
    /// # Errors
    ///   Problems creating the file.
    pub fn create(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut writer = BufWriter::new(File::create(path)?);
        let count_offset = write_ply_header(&mut writer, 0)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer,
            count: 0,
            count_offset,
        })
    }

    /// Appends a block of points.
    ///
    /// # Errors
    ///   Problems writing to file.
    pub fn push(&mut self, points: &[DVec3]) -> std::io::Result<()> {
        write_le_doubles(&mut self.writer, points)?;
        self.count += points.len() as u64;
        Ok(())
    }

    /// Points written so far.
    #[must_use]
    pub const fn count(&self) -> u64 {
        self.count
    }

    /// The file being written.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Patches the vertex count and closes the file.
    ///
    /// # Errors
    ///   Problems writing to file.
    pub fn finish(mut self) -> std::io::Result<u64> {
        self.writer.flush()?;
        let mut file = self.writer.into_inner().map_err(|e| e.into_error())?;
        file.seek(SeekFrom::Start(self.count_offset))?;
        write!(file, "{:<COUNT_WIDTH$}", self.count)?;
        file.flush()?;
        Ok(self.count)
    }
}

/// Return a point cloud stored in a PLY file.
///
/// Handles ascii, binary little endian and binary big endian files with any
/// scalar property types. `x`, `y` and `z` are required; every other scalar
/// vertex property is kept as an attribute. Elements after `vertex` are
/// ignored.
///
/// # Errors
///   If the file cannot be opened, the header is not understood, or the
///   payload is short or unparseable.
pub fn load_ply(path: &Path) -> Result<PointCloud, CloudError> {
    let file = File::open(path).map_err(io_error(path))?;
    let mut reader = BufReader::new(file);

    let header = parse_ply_header(&mut reader).map_err(|e| match e {
        HeaderError::Io(source) => CloudError::Io {
            path: path.to_path_buf(),
            source,
        },
        HeaderError::Malformed(reason) => CloudError::UnsupportedPly {
            path: path.to_path_buf(),
            reason,
        },
    })?;
    debug!("{header:#?}");

    let columns = [
        header.column("x"),
        header.column("y"),
        header.column("z"),
    ];
    let [Some(xi), Some(yi), Some(zi)] = columns else {
        return Err(CloudError::UnsupportedPly {
            path: path.to_path_buf(),
            reason: "vertex element lacks one of x, y, z".to_string(),
        });
    };

    let count = usize::try_from(header.vertex_count).map_err(|_| CloudError::UnsupportedPly {
        path: path.to_path_buf(),
        reason: "vertex count too large".to_string(),
    })?;
    let rows = match header.format {
        Format::Ascii => read_ascii_rows(path, &mut reader, &header, count)?,
        Format::BinaryLittleEndian | Format::BinaryBigEndian => {
            read_binary_rows(path, &mut reader, &header, count)?
        }
    };

    let mut points = Vec::with_capacity(count.min(1 << 20));
    for (i, row) in rows.chunks_exact(header.properties.len()).enumerate() {
        let p = DVec3::new(row[xi], row[yi], row[zi]);
        if !p.is_finite() {
            return Err(parse_error(path, i + 1, "non-finite coordinate"));
        }
        points.push(p);
    }

    let mut cloud = PointCloud::new(points)?;
    let width = header.properties.len();
    for (c, (label, _)) in header.properties.iter().enumerate() {
        if c == xi || c == yi || c == zi {
            continue;
        }
        let column = rows.iter().skip(c).step_by(width).copied().collect();
        cloud = cloud.with_attribute(label.clone(), column)?;
    }
    info!("load_ply - extracted points");
    Ok(cloud)
}

fn read_ascii_rows(
    path: &Path,
    reader: &mut BufReader<File>,
    header: &Header,
    count: usize,
) -> Result<Vec<f64>, CloudError> {
    let width = header.properties.len();
    let mut rows = Vec::with_capacity(count.min(1 << 20) * width);
    let mut line = String::new();
    let mut read = 0;
    while read < count {
        line.clear();
        if reader.read_line(&mut line).map_err(io_error(path))? == 0 {
            return Err(parse_error(
                path,
                read + 1,
                format!("expected {count} vertices, file ends after {read}"),
            ));
        }
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.is_empty() {
            continue;
        }
        read += 1;
        if parts.len() != width {
            return Err(parse_error(
                path,
                read,
                format!("expected {width} values, found {}", parts.len()),
            ));
        }
        for part in parts {
            let value: f64 = part
                .parse()
                .map_err(|e: core::num::ParseFloatError| parse_error(path, read, e.to_string()))?;
            rows.push(value);
        }
    }
    Ok(rows)
}

fn read_binary_rows(
    path: &Path,
    reader: &mut BufReader<File>,
    header: &Header,
    count: usize,
) -> Result<Vec<f64>, CloudError> {
    let little = matches!(header.format, Format::BinaryLittleEndian);
    let record: usize = header.properties.iter().map(|(_, t)| t.size()).sum();
    let mut bytes = vec![0_u8; record];
    let mut rows = Vec::with_capacity(count.min(1 << 20) * header.properties.len());
    for i in 0..count {
        reader.read_exact(&mut bytes).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                parse_error(path, i + 1, format!("expected {count} vertices, file ends after {i}"))
            } else {
                io_error(path)(e)
            }
        })?;
        let mut offset = 0;
        for (_, kind) in &header.properties {
            let size = kind.size();
            rows.push(kind.decode(&bytes[offset..offset + size], little));
            offset += size;
        }
    }
    Ok(rows)
}

// The file type of the PLY file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Ascii,
    BinaryLittleEndian,
    BinaryBigEndian,
}

/// Possible types of properties in a PLY file.
///
/// "The type can be specified with one of
///   char uchar short ushort int uint float double,
/// or one of
///   int8 uint8 int16 uint16 int32 uint32 float32 float64"
///
/// As described here <https://en.wikipedia.org/wiki/PLY_(file_format)>
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Type {
    Int8,
    Uint8,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Float32,
    Float64,
}

#[derive(Debug)]
struct UnknownType(String);

impl core::fmt::Display for UnknownType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Unknown type {}", self.0)
    }
}

impl Error for UnknownType {}

impl TryFrom<&str> for Type {
    type Error = UnknownType;
    fn try_from(input: &str) -> Result<Self, Self::Error> {
        match input {
            "char" | "int8" => Ok(Self::Int8),
            "uchar" | "uint8" => Ok(Self::Uint8),
            "short" | "int16" => Ok(Self::Int16),
            "ushort" | "uint16" => Ok(Self::Uint16),
            "int" | "int32" => Ok(Self::Int32),
            "uint" | "uint32" => Ok(Self::Uint32),
            "float" | "float32" => Ok(Self::Float32),
            "double" | "float64" => Ok(Self::Float64),
            _ => Err(UnknownType(input.to_string())),
        }
    }
}

impl Type {
    const fn size(self) -> usize {
        match self {
            Self::Int8 | Self::Uint8 => 1,
            Self::Int16 | Self::Uint16 => 2,
            Self::Int32 | Self::Uint32 | Self::Float32 => 4,
            Self::Float64 => 8,
        }
    }

    // `bytes` is exactly `self.size()` long.
    fn decode(self, bytes: &[u8], little: bool) -> f64 {
        macro_rules! read {
            ($t:ty, $n:literal) => {{
                let mut raw = [0_u8; $n];
                raw.copy_from_slice(bytes);
                if little {
                    <$t>::from_le_bytes(raw)
                } else {
                    <$t>::from_be_bytes(raw)
                }
            }};
        }
        match self {
            Self::Int8 => f64::from(read!(i8, 1)),
            Self::Uint8 => f64::from(read!(u8, 1)),
            Self::Int16 => f64::from(read!(i16, 2)),
            Self::Uint16 => f64::from(read!(u16, 2)),
            Self::Int32 => f64::from(read!(i32, 4)),
            Self::Uint32 => f64::from(read!(u32, 4)),
            Self::Float32 => f64::from(read!(f32, 4)),
            Self::Float64 => read!(f64, 8),
        }
    }
}

/// The header of a PLY file
#[derive(Debug)]
struct Header {
    /// The format of the PLY file.
    format: Format,
    /// The number of vertices in the PLY file.
    vertex_count: u64,
    /// The columns of the vertex element (label, type)
    properties: Vec<(String, Type)>,
}

impl Header {
    fn column(&self, label: &str) -> Option<usize> {
        self.properties.iter().position(|(l, _)| l == label)
    }
}

#[derive(Debug)]
enum HeaderError {
    Io(std::io::Error),
    Malformed(String),
}

impl From<std::io::Error> for HeaderError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

// Extract data from a PLY header
//header format
// ply
// format ascii 1.0
// comment This is a comment!
// element vertex 779966
// property float x
// property float y
// property float z
// end_header
//
// The second line is one of
// format ascii 1.0
// format binary_little_endian 1.0
// format binary_big_endian 1.0
//
fn parse_ply_header<R: BufRead>(reader: &mut R) -> Result<Header, HeaderError> {
    let malformed = |m: &str| HeaderError::Malformed(m.to_string());

    let mut line = String::new();
    reader.read_line(&mut line)?;
    if line.trim() != "ply" {
        return Err(malformed("missing \"ply\" magic"));
    }

    let mut format: Option<Format> = None;
    let mut properties = vec![];
    let mut vertex_count: Option<u64> = None;
    // The element whose properties are currently being declared.
    let mut in_vertex = false;

    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Err(malformed("no end_header"));
        }
        let parts: Vec<&str> = line.split_whitespace().collect();
        match parts.as_slice() {
            ["end_header"] => break,
            [] | ["comment" | "obj_info", ..] => {}
            ["format", kind, _version] => {
                format = Some(match *kind {
                    "ascii" => Format::Ascii,
                    "binary_little_endian" => Format::BinaryLittleEndian,
                    "binary_big_endian" => Format::BinaryBigEndian,
                    other => {
                        return Err(HeaderError::Malformed(format!("unknown format {other}")));
                    }
                });
            }
            ["element", name, count] => {
                let count: u64 = count
                    .parse()
                    .map_err(|_| HeaderError::Malformed(format!("bad element count {count}")))?;
                if *name == "vertex" {
                    vertex_count = Some(count);
                    in_vertex = true;
                } else {
                    if vertex_count.is_none() && count > 0 {
                        return Err(HeaderError::Malformed(format!(
                            "element {name} precedes vertex"
                        )));
                    }
                    in_vertex = false;
                }
            }
            ["property", "list", ..] => {
                if in_vertex {
                    return Err(malformed("list property in vertex element"));
                }
            }
            ["property", kind, label] => {
                if in_vertex {
                    let kind = Type::try_from(*kind)
                        .map_err(|e| HeaderError::Malformed(e.to_string()))?;
                    properties.push(((*label).to_string(), kind));
                }
            }
            _ => {
                return Err(HeaderError::Malformed(format!(
                    "unrecognised header line {:?}",
                    line.trim()
                )));
            }
        }
    }

    let format = format.ok_or_else(|| malformed("missing format line"))?;
    let vertex_count = vertex_count.ok_or_else(|| malformed("missing vertex element"))?;
    if properties.is_empty() {
        return Err(malformed("vertex element has no properties"));
    }
    Ok(Header {
        format,
        vertex_count,
        properties,
    })
}

/// Return the points of a `.npy` array of shape `(N, C)`, `C >= 3`.
///
/// Accepts `float32` and `float64` in either byte order, C order only.
/// Columns beyond the third are dropped.
///
/// # Errors
///   If the file cannot be read or is not such an array.
pub fn load_npy(path: &Path) -> Result<Vec<DVec3>, CloudError> {
    let bytes = std::fs::read(path).map_err(io_error(path))?;
    let npy = |reason: &str| CloudError::Npy {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };

    if bytes.len() < 10 || !bytes.starts_with(NPY_MAGIC) {
        return Err(npy("missing magic"));
    }
    let (header_len, header_start) = match bytes[6] {
        1 => (usize::from(u16::from_le_bytes([bytes[8], bytes[9]])), 10),
        2 | 3 => {
            let raw = bytes.get(8..12).ok_or_else(|| npy("truncated header"))?;
            let len = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
            (usize::try_from(len).map_err(|_| npy("header too large"))?, 12)
        }
        _ => return Err(npy("unsupported version")),
    };
    let data_start = header_start + header_len;
    let header = bytes
        .get(header_start..data_start)
        .ok_or_else(|| npy("truncated header"))?;
    let header = core::str::from_utf8(header).map_err(|_| npy("header is not text"))?;

    let descr = dict_value(header, "descr")
        .and_then(quoted)
        .ok_or_else(|| npy("no descr"))?;
    let (little, width) = match descr {
        "<f4" => (true, 4),
        "<f8" => (true, 8),
        ">f4" => (false, 4),
        ">f8" => (false, 8),
        _ => return Err(npy("dtype must be float32 or float64")),
    };
    if dict_value(header, "fortran_order").is_some_and(|v| v.starts_with("True")) {
        return Err(npy("fortran order arrays are not supported"));
    }
    let shape = dict_value(header, "shape").ok_or_else(|| npy("no shape"))?;
    let dims: Vec<usize> = shape
        .trim_start_matches('(')
        .split(')')
        .next()
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::parse)
        .collect::<Result<_, _>>()
        .map_err(|_| npy("bad shape"))?;
    let [rows, cols] = dims.as_slice() else {
        return Err(npy("array must be two dimensional"));
    };
    let (rows, cols) = (*rows, *cols);
    if cols < 3 {
        return Err(npy("need at least three columns"));
    }

    let payload = &bytes[data_start..];
    let needed = rows.checked_mul(cols).and_then(|n| n.checked_mul(width));
    if needed.is_none_or(|n| payload.len() < n) {
        return Err(npy("payload shorter than shape"));
    }
    let kind = if width == 4 { Type::Float32 } else { Type::Float64 };
    let value = |r: usize, c: usize| {
        let at = (r * cols + c) * width;
        kind.decode(&payload[at..at + width], little)
    };
    let mut points = Vec::with_capacity(rows);
    for r in 0..rows {
        let p = DVec3::new(value(r, 0), value(r, 1), value(r, 2));
        if !p.is_finite() {
            return Err(parse_error(path, r + 1, "non-finite coordinate"));
        }
        points.push(p);
    }
    Ok(points)
}

// The first quoted string in `text`.
fn quoted(text: &str) -> Option<&str> {
    let quote = text.chars().next().filter(|c| *c == '\'' || *c == '"')?;
    text[1..].split(quote).next()
}

// The text following `'key':` in a numpy header dict.
fn dict_value<'a>(header: &'a str, key: &str) -> Option<&'a str> {
    let needle = format!("'{key}':");
    let start = header.find(&needle)? + needle.len();
    Some(header[start..].trim_start())
}

/// Write points as a `(N, 3)` little endian `float64` `.npy` array.
///
/// # Errors
///   Problems writing to file.
pub fn save_npy(path: &Path, points: &[DVec3]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut dict = format!(
        "{{'descr': '<f8', 'fortran_order': False, 'shape': ({}, 3), }}",
        points.len()
    );
    // magic + version + u16 length + dict + '\n' is padded to 64 bytes.
    let unpadded = NPY_MAGIC.len() + 2 + 2 + dict.len() + 1;
    dict.push_str(&" ".repeat((64 - unpadded % 64) % 64));
    dict.push('\n');
    let header_len = u16::try_from(dict.len()).map_err(std::io::Error::other)?;

    let mut writer = BufWriter::new(File::create(path)?);
    writer.write_all(NPY_MAGIC)?;
    writer.write_all(&[1, 0])?;
    writer.write_all(&header_len.to_le_bytes())?;
    writer.write_all(dict.as_bytes())?;
    write_le_doubles(&mut writer, points)?;
    writer.flush()
}
