use std::fs::{self, File};
use std::path::Path;

use log::{debug, info};
use ndarray::prelude::*;
use ndarray_npy::{NpzReader, NpzWriter};

use super::Parameterized;
use crate::error::{PipelineError, Result};

/// Writes every parameter into one `.npz` archive, keyed by parameter identifier.
pub fn serialize(parameterized: &dyn Parameterized, path: &Path) -> Result<()> {
    info!(
        "serializing {} to {} ...",
        parameterized.identifier(),
        path.display()
    );
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut npz_writer = NpzWriter::new(File::create(path)?);
    for parameter in parameterized.parameters() {
        npz_writer.add_array(parameter.identifier(), &*parameter.borrow_array())?;
    }
    npz_writer.finish()?;
    Ok(())
}

/// Overwrites the parameters of `parameterized` in place. Arrays whose shape
/// differs from the parameter they replace are rejected.
pub fn deserialize(parameterized: &dyn Parameterized, path: &Path) -> Result<()> {
    if !path.exists() {
        return Err(PipelineError::not_found("weights", path));
    }
    let mut npz_reader = NpzReader::new(File::open(path)?)?;
    for parameter in parameterized.parameters() {
        debug!("loading weights for {:?}", parameter.identifier());
        let array: ArrayD<f32> = npz_reader.by_name(parameter.identifier())?;
        if array.shape() != parameter.borrow_array().shape() {
            return Err(PipelineError::ShapeMismatch {
                identifier: parameter.identifier().to_owned(),
                expected: parameter.borrow_array().shape().to_vec(),
                found: array.shape().to_vec(),
            });
        }
        *parameter.borrow_array_mut() = array;
    }
    Ok(())
}
