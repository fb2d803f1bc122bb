use std::path::{Component, Path, PathBuf};

use crate::errors::MethodError;

const MAX_COMPONENT_CODE_LEN: usize = 5;

pub fn ensure_absolute_dir(dir: &str) -> Result<PathBuf, MethodError> {
    let path = Path::new(dir);
    if path.is_relative() {
        return Err(MethodError::value(format!(
            "working directory '{dir}' must be an absolute path"
        )));
    }
    if !path.is_dir() {
        return Err(MethodError::value(format!(
            "working directory '{dir}' does not exist or is not a directory"
        )));
    }
    Ok(path.to_path_buf())
}

pub fn ensure_existing_file(label: &str, file: &str) -> Result<PathBuf, MethodError> {
    let path = PathBuf::from(file);
    if !path.is_file() {
        return Err(MethodError::value(format!("{label} '{file}' does not exist")));
    }
    Ok(path)
}

/// Joins a plain file name onto `base`, refusing anything that would escape it.
pub fn resolve(base: &Path, relative: impl AsRef<Path>) -> Result<PathBuf, MethodError> {
    let relative = relative.as_ref();
    if relative.components().count() == 0 {
        return Err(MethodError::value("path must not be empty"));
    }
    if relative.is_absolute() {
        return Err(MethodError::value(format!(
            "'{}' must be relative to {}",
            relative.display(),
            base.display()
        )));
    }

    let mut clean = PathBuf::new();
    for component in relative.components() {
        match component {
            Component::CurDir => continue,
            Component::Normal(part) => clean.push(part),
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(MethodError::value(format!(
                    "path traversal detected in '{}'",
                    relative.display()
                )))
            }
        }
    }
    Ok(base.join(clean))
}

/// Chemical component ids are one to five ASCII letters or digits.
pub fn validate_component_code(code: &str) -> Result<&str, MethodError> {
    let valid = !code.is_empty()
        && code.len() <= MAX_COMPONENT_CODE_LEN
        && code.chars().all(|c| c.is_ascii_alphanumeric());
    if valid {
        Ok(code)
    } else {
        Err(MethodError::value(format!(
            "'{code}' is not a valid chemical component code"
        )))
    }
}

pub fn restraint_file_name(code: &str) -> String {
    format!("{code}_restraints.cif")
}
