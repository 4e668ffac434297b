//! Feeding and reading ONNX sessions.
//!
//! Exports of the same model disagree on input names and integer widths, so
//! inputs are offered by name and only those a session declares are fed.

use std::sync::{Mutex, MutexGuard};

use ndarray::{ArrayD, IxDyn};
use ort::session::{Session, SessionInputValue};
use ort::tensor::TensorElementType;
use ort::value::{Tensor, ValueType};

use crate::error::{Error, Result};

/// Named inputs for one `Session::run` call.
pub type Inputs = Vec<(String, SessionInputValue<'static>)>;

/// A session shared behind `&self`.
///
/// `Session::run` needs `&mut`, which is state owned by the runtime rather
/// than by the caller, so it lives behind a lock.
pub struct SharedSession {
    name: &'static str,
    session: Mutex<Session>,
}

impl SharedSession {
    /// Wrap a loaded session.
    #[must_use]
    pub const fn new(name: &'static str, session: Session) -> Self {
        Self {
            name,
            session: Mutex::new(session),
        }
    }

    /// Model name used in errors and logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Lock the session for one or more runs.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionPoisoned`] if a previous caller panicked mid-run.
    pub fn lock(&self) -> Result<MutexGuard<'_, Session>> {
        self.session
            .lock()
            .map_err(|_| Error::SessionPoisoned { model: self.name })
    }

    /// Run the session and return every output as an `f32` array, in
    /// declaration order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Generation`] if inference fails.
    pub fn run(&self, inputs: Inputs) -> Result<Vec<ArrayD<f32>>> {
        let mut session = self.lock()?;
        run_locked(self.name, &mut session, inputs)
    }
}

/// Run an already locked session.
///
/// # Errors
///
/// Returns [`Error::Generation`] if inference fails.
pub fn run_locked(model: &'static str, session: &mut Session, inputs: Inputs) -> Result<Vec<ArrayD<f32>>> {
    let outputs = session
        .run(inputs)
        .map_err(|source| Error::Generation { model, source })?;

    outputs
        .values()
        .map(|value| extract_array(model, &value))
        .collect()
}

/// Names of the inputs a session declares, in order.
#[must_use]
pub fn input_names(session: &Session) -> Vec<String> {
    session.inputs.iter().map(|input| input.name.clone()).collect()
}

/// Number of outputs a session declares.
#[must_use]
pub fn output_count(session: &Session) -> usize {
    session.outputs.len()
}

/// Element type of the named input, if the session declares it as a tensor.
#[must_use]
pub fn input_element_type(session: &Session, name: &str) -> Option<TensorElementType> {
    session
        .inputs
        .iter()
        .find(|input| input.name == name)
        .and_then(|input| match &input.input_type {
            ValueType::Tensor { ty, .. } => Some(*ty),
            _ => None,
        })
}

/// Wrap an `f32` array as a session input.
///
/// # Errors
///
/// Returns [`Error::Generation`] if the tensor cannot be created.
pub fn float_input<D: ndarray::Dimension + 'static>(
    model: &'static str,
    array: ndarray::Array<f32, D>,
) -> Result<SessionInputValue<'static>> {
    Tensor::from_array(array)
        .map(Into::into)
        .map_err(|source| Error::Generation { model, source })
}

/// Wrap integer values of shape `shape` in the width the session expects.
///
/// Falls back to `int64` when the declared type is unknown.
///
/// # Errors
///
/// Returns [`Error::Generation`] if the tensor cannot be created.
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
pub fn integer_input(
    model: &'static str,
    element_type: Option<TensorElementType>,
    shape: &[usize],
    values: &[i64],
) -> Result<SessionInputValue<'static>> {
    let dims = IxDyn(shape);
    let tensor: ort::Result<SessionInputValue<'static>> = match element_type {
        Some(TensorElementType::Int32) => {
            // Token ids and timesteps fit in i32
            let data = values.iter().map(|&v| v as i32).collect();
            Tensor::from_array(array_of(dims, data)?).map(Into::into)
        }
        Some(TensorElementType::Float32) => {
            let data = values.iter().map(|&v| v as f32).collect();
            Tensor::from_array(array_of(dims, data)?).map(Into::into)
        }
        _ => Tensor::from_array(array_of(dims, values.to_vec())?).map(Into::into),
    };

    tensor.map_err(|source| Error::Generation { model, source })
}

fn array_of<T>(dims: IxDyn, data: Vec<T>) -> Result<ArrayD<T>> {
    let expected = format!("{dims:?}");
    ArrayD::from_shape_vec(dims, data).map_err(|_| Error::ShapeMismatch {
        expected,
        actual: "wrong element count".to_string(),
    })
}

/// Extract an `f32` array from an ONNX value.
#[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
fn extract_array(model: &'static str, value: &ort::value::ValueRef<'_>) -> Result<ArrayD<f32>> {
    let (shape_info, data) = value
        .try_extract_tensor::<f32>()
        .map_err(|source| Error::Generation { model, source })?;

    // Safe: tensor dimensions are always non-negative and within bounds
    let dims: Vec<usize> = shape_info.iter().map(|&x| x as usize).collect();

    ArrayD::from_shape_vec(IxDyn(&dims), data.to_vec()).map_err(|_| Error::ShapeMismatch {
        expected: format!("{dims:?}"),
        actual: "reshape failed".to_string(),
    })
}

/// Reshape a dynamic output to four dimensions.
///
/// # Errors
///
/// Returns [`Error::ShapeMismatch`] if the array is not 4D.
pub fn into_array4(array: ArrayD<f32>) -> Result<ndarray::Array4<f32>> {
    let ndim = array.ndim();
    array
        .into_dimensionality::<ndarray::Ix4>()
        .map_err(|_| Error::ShapeMismatch {
            expected: "4D tensor".to_string(),
            actual: format!("{ndim}D tensor"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_into_array4_rejects_other_ranks() {
        let flat = ArrayD::<f32>::zeros(IxDyn(&[2, 3]));
        let err = into_array4(flat).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));

        let image = ArrayD::<f32>::zeros(IxDyn(&[1, 3, 4, 4]));
        assert_eq!(into_array4(image).unwrap().dim(), (1, 3, 4, 4));
    }

    #[test]
    fn test_array_of_checks_element_count() {
        assert!(array_of(IxDyn(&[2, 2]), vec![1i64, 2, 3]).is_err());
        assert!(array_of(IxDyn(&[1, 3]), vec![1i64, 2, 3]).is_ok());
    }
}
