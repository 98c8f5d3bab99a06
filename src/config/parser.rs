//! 配置解析 (Configuration parser)
//!
//! Typed accessors over a YAML mapping. Every accessor is pure: it only
//! reads `src` (and, for paths, checks the filesystem).
//!
//! Failure kinds:
//! - key absent → `NotFound`
//! - wrong value type (or any list element) → `Type`
//! - list length differs from `nentries` → `Arity`
//! - `nentries < 1` → `InvalidArgument`
//! - path missing or of the wrong kind → `Io`

use std::path::{Path, PathBuf};

use serde_yaml::{Mapping, Value};

use crate::error::{Error, ErrorKind, Result};

/// Read and parse a YAML configuration document. The top level must be a
/// mapping.
pub fn open_configuration(path: impl AsRef<Path>) -> Result<Mapping> {
    let path = path.as_ref();
    if !path.is_file() {
        return Err(Error::io(format!(
            "configuration file not found: {}",
            path.display()
        )));
    }
    let text = std::fs::read_to_string(path)?;
    let doc: Value = serde_yaml::from_str(&text).map_err(|e| {
        Error::with_source(
            ErrorKind::Type,
            format!("malformed configuration {}", path.display()),
            e,
        )
    })?;
    match doc {
        Value::Mapping(map) => Ok(map),
        // 空文件视为空配置
        Value::Null => Ok(Mapping::new()),
        _ => Err(Error::type_mismatch(format!(
            "configuration {} must be a mapping of attributes",
            path.display()
        ))),
    }
}

fn lookup<'a>(src: &'a Mapping, key: &str) -> Result<&'a Value> {
    src.get(key)
        .ok_or_else(|| Error::not_found(format!("attribute <{}> not found", key)))
}

fn entries<T>(
    src: &Mapping,
    key: &str,
    nentries: usize,
    expected: &str,
    extract: impl Fn(&Value) -> Option<T>,
) -> Result<Vec<T>> {
    if nentries < 1 {
        return Err(Error::invalid_argument(format!(
            "attribute <{}>: nentries must be at least 1, got {}",
            key, nentries
        )));
    }
    let value = lookup(src, key)?;
    let values: Vec<&Value> = match value {
        Value::Sequence(seq) => seq.iter().collect(),
        scalar if nentries == 1 => vec![scalar],
        _ => {
            return Err(Error::arity(format!(
                "attribute <{}> expects {} entries, found a single value",
                key, nentries
            )))
        }
    };
    let parsed = values
        .iter()
        .map(|v| {
            extract(v).ok_or_else(|| {
                Error::type_mismatch(format!("attribute <{}> expects {} values", key, expected))
            })
        })
        .collect::<Result<Vec<T>>>()?;
    if parsed.len() != nentries {
        return Err(Error::arity(format!(
            "attribute <{}> expects {} entries, found {}",
            key,
            nentries,
            parsed.len()
        )));
    }
    Ok(parsed)
}

fn single<T>(mut values: Vec<T>) -> T {
    // entries() guarantees exactly one element when nentries == 1
    values.remove(0)
}

fn as_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        _ => None,
    }
}

fn as_float(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) if n.is_f64() => n.as_f64(),
        _ => None,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

fn as_bool(value: &Value) -> Option<bool> {
    value.as_bool()
}

fn as_string(value: &Value) -> Option<String> {
    value.as_str().map(str::to_owned)
}

pub fn parse_int(src: &Mapping, key: &str) -> Result<i64> {
    entries(src, key, 1, "integer", as_int).map(single)
}

pub fn parse_ints(src: &Mapping, key: &str, nentries: usize) -> Result<Vec<i64>> {
    entries(src, key, nentries, "integer", as_int)
}

pub fn parse_float(src: &Mapping, key: &str) -> Result<f64> {
    entries(src, key, 1, "floating point", as_float).map(single)
}

pub fn parse_floats(src: &Mapping, key: &str, nentries: usize) -> Result<Vec<f64>> {
    entries(src, key, nentries, "floating point", as_float)
}

/// Numeric value written either as an integer or as a float.
pub fn parse_int_or_float(src: &Mapping, key: &str) -> Result<f64> {
    entries(src, key, 1, "numeric", as_number).map(single)
}

pub fn parse_ints_or_floats(src: &Mapping, key: &str, nentries: usize) -> Result<Vec<f64>> {
    entries(src, key, nentries, "numeric", as_number)
}

pub fn parse_bool(src: &Mapping, key: &str) -> Result<bool> {
    entries(src, key, 1, "boolean", as_bool).map(single)
}

pub fn parse_bools(src: &Mapping, key: &str, nentries: usize) -> Result<Vec<bool>> {
    entries(src, key, nentries, "boolean", as_bool)
}

pub fn parse_string(src: &Mapping, key: &str) -> Result<String> {
    entries(src, key, 1, "string", as_string).map(single)
}

pub fn parse_strings(src: &Mapping, key: &str, nentries: usize) -> Result<Vec<String>> {
    entries(src, key, nentries, "string", as_string)
}

/// Integer list of any non-zero length.
pub fn parse_int_sequence(src: &Mapping, key: &str) -> Result<Vec<i64>> {
    let value = lookup(src, key)?;
    let len = match value {
        Value::Sequence(seq) => seq.len(),
        _ => 1,
    };
    if len == 0 {
        return Err(Error::arity(format!(
            "attribute <{}> expects at least one entry",
            key
        )));
    }
    entries(src, key, len, "integer", as_int)
}

pub fn parse_file(src: &Mapping, key: &str) -> Result<PathBuf> {
    let path = PathBuf::from(parse_string(src, key)?);
    if path.is_file() {
        Ok(path)
    } else {
        Err(Error::io(format!("file not found: {}", path.display())))
    }
}

pub fn parse_directory(src: &Mapping, key: &str) -> Result<PathBuf> {
    let path = PathBuf::from(parse_string(src, key)?);
    if path.is_dir() {
        Ok(path)
    } else {
        Err(Error::io(format!("directory not found: {}", path.display())))
    }
}

/// Turn an absent attribute into `None`; every other failure is kept.
pub fn parse_optional<T>(parsed: Result<T>) -> Result<Option<T>> {
    match parsed {
        Ok(value) => Ok(Some(value)),
        Err(err) if err.is(ErrorKind::NotFound) => Ok(None),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(yaml: &str) -> Mapping {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_scalars() {
        let src = mapping("diameter: 11\nminmass: 100.5\npredict: true\nformat: csv\n");
        assert_eq!(parse_int(&src, "diameter").unwrap(), 11);
        assert_eq!(parse_float(&src, "minmass").unwrap(), 100.5);
        assert!(parse_bool(&src, "predict").unwrap());
        assert_eq!(parse_string(&src, "format").unwrap(), "csv");
        assert_eq!(parse_int_or_float(&src, "diameter").unwrap(), 11.0);
        assert_eq!(parse_int_or_float(&src, "minmass").unwrap(), 100.5);
    }

    #[test]
    fn test_missing_key_is_not_found() {
        let src = mapping("diameter: 11\n");
        for err in [
            parse_int(&src, "memory").unwrap_err(),
            parse_float(&src, "memory").unwrap_err(),
            parse_bool(&src, "memory").unwrap_err(),
            parse_string(&src, "memory").unwrap_err(),
            parse_ints(&src, "memory", 4).unwrap_err(),
            parse_file(&src, "memory").unwrap_err(),
            parse_directory(&src, "memory").unwrap_err(),
        ] {
            assert_eq!(err.kind(), ErrorKind::NotFound);
        }
    }

    #[test]
    fn test_wrong_type() {
        let src = mapping("a: 1.5\nb: [1, 2.5, 3, 4]\nc: yes-please\nd: 3\n");
        assert_eq!(parse_int(&src, "a").unwrap_err().kind(), ErrorKind::Type);
        assert_eq!(parse_ints(&src, "b", 4).unwrap_err().kind(), ErrorKind::Type);
        assert_eq!(parse_bool(&src, "c").unwrap_err().kind(), ErrorKind::Type);
        assert_eq!(parse_float(&src, "d").unwrap_err().kind(), ErrorKind::Type);
        assert_eq!(parse_string(&src, "d").unwrap_err().kind(), ErrorKind::Type);
    }

    #[test]
    fn test_wrong_arity() {
        let src = mapping("margins: [0, 10, 0]\nperiod: 5\n");
        assert_eq!(
            parse_ints(&src, "margins", 4).unwrap_err().kind(),
            ErrorKind::Arity
        );
        assert_eq!(
            parse_ints(&src, "period", 2).unwrap_err().kind(),
            ErrorKind::Arity
        );
        assert_eq!(parse_ints(&src, "margins", 3).unwrap(), vec![0, 10, 0]);
    }

    #[test]
    fn test_nentries_must_be_positive() {
        let src = mapping("margins: [0, 10, 0, 5]\n");
        assert_eq!(
            parse_ints(&src, "margins", 0).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
    }

    #[test]
    fn test_int_sequence() {
        let src = mapping("ids: [3, 1, 4]\none: 7\nnone: []\n");
        assert_eq!(parse_int_sequence(&src, "ids").unwrap(), vec![3, 1, 4]);
        assert_eq!(parse_int_sequence(&src, "one").unwrap(), vec![7]);
        assert_eq!(
            parse_int_sequence(&src, "none").unwrap_err().kind(),
            ErrorKind::Arity
        );
    }

    #[test]
    fn test_paths() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("clip.gif");
        std::fs::write(&file, b"GIF89a").unwrap();
        let src = mapping(&format!(
            "video: {}\noutdir: {}\nmissing: {}\n",
            file.display(),
            dir.path().display(),
            dir.path().join("nope.gif").display()
        ));
        assert_eq!(parse_file(&src, "video").unwrap(), file);
        assert_eq!(parse_directory(&src, "outdir").unwrap(), dir.path());
        assert_eq!(parse_file(&src, "missing").unwrap_err().kind(), ErrorKind::Io);
        assert_eq!(parse_directory(&src, "video").unwrap_err().kind(), ErrorKind::Io);
        assert_eq!(parse_file(&src, "outdir").unwrap_err().kind(), ErrorKind::Io);
    }

    #[test]
    fn test_parse_optional() {
        let src = mapping("memory: 3\nbad: x\n");
        assert_eq!(parse_optional(parse_int(&src, "memory")).unwrap(), Some(3));
        assert_eq!(parse_optional(parse_int(&src, "absent")).unwrap(), None);
        assert!(parse_optional(parse_int(&src, "bad")).is_err());
    }

    #[test]
    fn test_open_configuration() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yml");
        std::fs::write(&path, "diameter: 11\njobs:\n  - video: a.gif\n").unwrap();
        let config = open_configuration(&path).unwrap();
        assert_eq!(parse_int(&config, "diameter").unwrap(), 11);

        let err = open_configuration(dir.path().join("absent.yml")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);

        std::fs::write(&path, "- just\n- a list\n").unwrap();
        assert_eq!(open_configuration(&path).unwrap_err().kind(), ErrorKind::Type);
    }
}
