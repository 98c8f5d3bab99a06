//! 特征表读写 (Feature table persistence)
//!
//! 三种格式:
//! - table: 列式二进制 `PTAB` (u32 版本, u32 列数, u64 行数, 列名, 每列 LE f64)
//! - csv:   `index,y,x,...` 表头, 每行一条记录
//! - json:  按列组织 `{"x": {"0": v}}`

use std::fs;
use std::path::Path;

use serde_json::{Map, Value};

use super::Feature;
use crate::config::ExportFormat;
use crate::error::{Error, ErrorKind, Result};

const MAGIC: &[u8; 4] = b"PTAB";
const VERSION: u32 = 1;

/// Column order shared by every format.
pub const COLUMNS: [&str; 9] = [
    "y", "x", "mass", "size", "ecc", "signal", "raw_mass", "frame", "particle",
];

/// Integer-valued columns, written without a fractional part.
const INTEGER_COLUMNS: [&str; 2] = ["frame", "particle"];

/// Write `features` to `path`, replacing any existing file.
pub fn write(path: &Path, format: ExportFormat, features: &[Feature]) -> Result<()> {
    if path.exists() {
        fs::remove_file(path)?;
    }
    let columns = to_columns(features);
    match format {
        ExportFormat::Table => write_table(path, &columns, features.len()),
        ExportFormat::Csv => write_csv(path, &columns, features.len()),
        ExportFormat::Json => write_json(path, &columns),
    }
}

pub fn read(path: &Path, format: ExportFormat) -> Result<Vec<Feature>> {
    let columns = match format {
        ExportFormat::Table => read_table(path)?,
        ExportFormat::Csv => read_csv(path)?,
        ExportFormat::Json => read_json(path)?,
    };
    from_columns(columns).map_err(|e| {
        Error::new(e.kind(), format!("{}: {}", path.display(), e.message()))
    })
}

type Columns = Vec<(String, Vec<f64>)>;

fn to_columns(features: &[Feature]) -> Columns {
    let linked = !features.is_empty() && features.iter().all(|f| f.particle.is_some());
    COLUMNS
        .iter()
        .filter(|name| linked || **name != "particle")
        .map(|name| {
            let values = features
                .iter()
                .map(|f| match *name {
                    "y" => f.y,
                    "x" => f.x,
                    "mass" => f.mass,
                    "size" => f.size,
                    "ecc" => f.ecc,
                    "signal" => f.signal,
                    "raw_mass" => f.raw_mass,
                    "frame" => f.frame as f64,
                    _ => f.particle.unwrap_or_default() as f64,
                })
                .collect();
            (name.to_string(), values)
        })
        .collect()
}

fn from_columns(columns: Columns) -> Result<Vec<Feature>> {
    let rows = columns.first().map_or(0, |(_, v)| v.len());
    if let Some((name, _)) = columns.iter().find(|(_, v)| v.len() != rows) {
        return Err(Error::arity(format!("column <{}> has a different length", name)));
    }
    let column = |name: &str| columns.iter().find(|(n, _)| n == name).map(|(_, v)| v);
    let required = |name: &str| {
        column(name).ok_or_else(|| Error::not_found(format!("column <{}> not found", name)))
    };
    let (ys, xs, frames) = (required("y")?, required("x")?, required("frame")?);
    let optional = |name: &str, i: usize| column(name).map_or(0.0, |v| v[i]);
    let particles = column("particle");

    (0..rows)
        .map(|i| {
            let frame = frames[i];
            if frame < 0.0 || frame.fract() != 0.0 {
                return Err(Error::type_mismatch(format!("invalid frame index {}", frame)));
            }
            Ok(Feature {
                y: ys[i],
                x: xs[i],
                mass: optional("mass", i),
                size: optional("size", i),
                ecc: optional("ecc", i),
                signal: optional("signal", i),
                raw_mass: optional("raw_mass", i),
                frame: frame as usize,
                particle: particles.map(|p| p[i] as i64),
            })
        })
        .collect()
}

fn write_table(path: &Path, columns: &Columns, rows: usize) -> Result<()> {
    let mut buf = Vec::with_capacity(20 + columns.len() * (16 + rows * 8));
    buf.extend_from_slice(MAGIC);
    buf.extend_from_slice(&VERSION.to_le_bytes());
    buf.extend_from_slice(&(columns.len() as u32).to_le_bytes());
    buf.extend_from_slice(&(rows as u64).to_le_bytes());
    for (name, _) in columns {
        buf.extend_from_slice(&(name.len() as u16).to_le_bytes());
        buf.extend_from_slice(name.as_bytes());
    }
    for (_, values) in columns {
        for v in values {
            buf.extend_from_slice(&v.to_le_bytes());
        }
    }
    fs::write(path, buf)?;
    Ok(())
}

/// Little-endian cursor over a byte slice.
struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).filter(|e| *e <= self.bytes.len());
        match end {
            Some(end) => {
                let out = &self.bytes[self.pos..end];
                self.pos = end;
                Ok(out)
            }
            None => Err(Error::io("truncated table file")),
        }
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }
}

fn read_table(path: &Path) -> Result<Columns> {
    let bytes = fs::read(path)?;
    let mut r = Reader { bytes: &bytes, pos: 0 };
    if r.take(4)? != MAGIC {
        return Err(Error::type_mismatch(format!("{} is not a table file", path.display())));
    }
    let version = u32::from_le_bytes(r.array()?);
    if version != VERSION {
        return Err(Error::unsupported(format!("table version {}", version)));
    }
    let ncols = u32::from_le_bytes(r.array()?) as usize;
    let nrows = u64::from_le_bytes(r.array()?) as usize;

    let mut names = Vec::with_capacity(ncols);
    for _ in 0..ncols {
        let len = u16::from_le_bytes(r.array()?) as usize;
        let name = std::str::from_utf8(r.take(len)?)
            .map_err(|e| Error::with_source(ErrorKind::Type, "column name", e))?;
        names.push(name.to_string());
    }
    names
        .into_iter()
        .map(|name| {
            let values = (0..nrows)
                .map(|_| Ok(f64::from_le_bytes(r.array()?)))
                .collect::<Result<Vec<_>>>()?;
            Ok((name, values))
        })
        .collect()
}

fn write_csv(path: &Path, columns: &Columns, rows: usize) -> Result<()> {
    let mut out = String::from("index");
    for (name, _) in columns {
        out.push(',');
        out.push_str(name);
    }
    out.push('\n');
    for i in 0..rows {
        out.push_str(&i.to_string());
        for (name, values) in columns {
            out.push(',');
            if INTEGER_COLUMNS.contains(&name.as_str()) {
                out.push_str(&(values[i] as i64).to_string());
            } else {
                out.push_str(&values[i].to_string());
            }
        }
        out.push('\n');
    }
    fs::write(path, out)?;
    Ok(())
}

fn read_csv(path: &Path) -> Result<Columns> {
    let text = fs::read_to_string(path)?;
    let mut lines = text.lines().filter(|l| !l.trim().is_empty());
    let header = lines
        .next()
        .ok_or_else(|| Error::type_mismatch(format!("{} has no header", path.display())))?;
    let names: Vec<&str> = header.split(',').map(str::trim).collect();
    let mut columns: Columns = names.iter().map(|n| (n.to_string(), Vec::new())).collect();

    for (lineno, line) in lines.enumerate() {
        let cells: Vec<&str> = line.split(',').collect();
        if cells.len() != names.len() {
            return Err(Error::arity(format!(
                "{} row {} has {} cells, expected {}",
                path.display(),
                lineno + 1,
                cells.len(),
                names.len()
            )));
        }
        for (col, cell) in columns.iter_mut().zip(cells) {
            let v: f64 = cell.trim().parse().map_err(|_| {
                Error::type_mismatch(format!("{} row {}: invalid number '{}'", path.display(), lineno + 1, cell))
            })?;
            col.1.push(v);
        }
    }
    columns.retain(|(n, _)| n != "index");
    Ok(columns)
}

fn write_json(path: &Path, columns: &Columns) -> Result<()> {
    let mut object = Map::new();
    for (name, values) in columns {
        let integer = INTEGER_COLUMNS.contains(&name.as_str());
        let column: Map<String, Value> = values
            .iter()
            .enumerate()
            .map(|(i, v)| {
                let value = if integer {
                    Value::from(*v as i64)
                } else {
                    Value::from(*v)
                };
                (i.to_string(), value)
            })
            .collect();
        object.insert(name.clone(), Value::Object(column));
    }
    fs::write(path, serde_json::to_vec(&Value::Object(object))?)?;
    Ok(())
}

fn read_json(path: &Path) -> Result<Columns> {
    let value: Value = serde_json::from_slice(&fs::read(path)?)?;
    let object = value
        .as_object()
        .ok_or_else(|| Error::type_mismatch(format!("{} is not a JSON object", path.display())))?;
    object
        .iter()
        .map(|(name, column)| {
            let cells = column
                .as_object()
                .ok_or_else(|| Error::type_mismatch(format!("column <{}> is not an object", name)))?;
            let mut indexed = cells
                .iter()
                .map(|(k, v)| {
                    let index: usize = k
                        .parse()
                        .map_err(|_| Error::type_mismatch(format!("row index '{}'", k)))?;
                    let value = v
                        .as_f64()
                        .ok_or_else(|| Error::type_mismatch(format!("column <{}> row {}", name, k)))?;
                    Ok((index, value))
                })
                .collect::<Result<Vec<_>>>()?;
            indexed.sort_by_key(|(i, _)| *i);
            Ok((name.clone(), indexed.into_iter().map(|(_, v)| v).collect()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(linked: bool) -> Vec<Feature> {
        (0..4)
            .map(|i| Feature {
                y: 3.25 + i as f64,
                x: 100.0 / 3.0 + i as f64,
                mass: 1234.5,
                size: 2.1,
                ecc: 0.05,
                signal: 88.0,
                raw_mass: 4321.0,
                frame: i / 2,
                particle: linked.then_some((i % 2) as i64),
            })
            .collect()
    }

    #[test]
    fn test_every_format_preserves_records() {
        let dir = tempfile::tempdir().unwrap();
        for format in [ExportFormat::Table, ExportFormat::Csv, ExportFormat::Json] {
            let path = dir.path().join(format!("tracks.{}", format.extension()));
            write(&path, format, &sample(true)).unwrap();
            assert_eq!(read(&path, format).unwrap(), sample(true), "{:?}", format);
        }
    }

    #[test]
    fn test_csv_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tracks.csv");
        write(&path, ExportFormat::Csv, &sample(true)).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next(),
            Some("index,y,x,mass,size,ecc,signal,raw_mass,frame,particle")
        );
        assert!(lines.next().unwrap().starts_with("0,3.25,"));
        assert!(text.lines().nth(4).unwrap().ends_with(",1,1"));
    }

    #[test]
    fn test_unlinked_table_has_no_particle_column() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locate.ptab");
        write(&path, ExportFormat::Table, &sample(false)).unwrap();
        let back = read(&path, ExportFormat::Table).unwrap();
        assert!(back.iter().all(|f| f.particle.is_none()));
        // 覆盖写
        write(&path, ExportFormat::Table, &sample(true)[..1]).unwrap();
        assert_eq!(read(&path, ExportFormat::Table).unwrap().len(), 1);
    }

    #[test]
    fn test_json_is_column_oriented() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tracks.json");
        write(&path, ExportFormat::Json, &sample(true)).unwrap();
        let value: Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(value["y"]["0"], Value::from(3.25));
        assert_eq!(value["frame"]["3"], Value::from(1));
    }

    #[test]
    fn test_rejects_corrupt_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.ptab");
        fs::write(&path, b"NOPE").unwrap();
        assert_eq!(read(&path, ExportFormat::Table).unwrap_err().kind(), ErrorKind::Type);

        write(&path, ExportFormat::Table, &sample(true)).unwrap();
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 3]).unwrap();
        assert_eq!(read(&path, ExportFormat::Table).unwrap_err().kind(), ErrorKind::Io);

        let csv = dir.path().join("bad.csv");
        fs::write(&csv, "index,x\n0,1.0\n").unwrap();
        assert_eq!(read(&csv, ExportFormat::Csv).unwrap_err().kind(), ErrorKind::NotFound);

        assert_eq!(
            read(&dir.path().join("missing.csv"), ExportFormat::Csv).unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }
}
