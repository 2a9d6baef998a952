//! Marshalling: pairwise host↔device conversion per type.
//!
//! User-registered pairs take precedence; for everything they leave out, the
//! registry derives a structural default — element-wise concatenation for
//! records, one bulk copy for lane vectors, fixed-width little-endian scalars.
//! Foreign (`Named`) types have no derivable layout, so a signature that
//! reaches one without a user pair fails the offload.

use std::sync::Arc;

use ndarray::Array1;
use rustc_hash::FxHashMap;

use crate::error::TransformError;
use crate::eval::Value;
use crate::fd::dtype::DType;
use crate::offload::target::DeviceError;

/// One type's host→device / device→host procedure pair.
#[derive(Clone)]
pub struct MarshalOps {
    pub to_device: Arc<dyn Fn(&Value) -> Result<Vec<u8>, DeviceError> + Send + Sync>,
    pub to_host: Arc<dyn Fn(&[u8]) -> Result<Value, DeviceError> + Send + Sync>,
}

impl std::fmt::Debug for MarshalOps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MarshalOps")
    }
}

#[derive(Debug, Clone, Default)]
pub struct MarshalRegistry {
    user: FxHashMap<DType, MarshalOps>,
    /// Upper bound on one bulk lane transfer, when the transport has one.
    lane_limit: Option<usize>,
}

impl MarshalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, dtype: DType, ops: MarshalOps) {
        self.user.insert(dtype, ops);
    }

    pub fn with_lane_limit(mut self, bytes: usize) -> Self {
        self.lane_limit = Some(bytes);
        self
    }

    /// Resolves the marshalling pair for a type, deriving structural
    /// defaults where possible. `context` names what required the type, for
    /// the error report.
    pub fn resolve(&self, dtype: &DType, context: &str) -> Result<MarshalOps, TransformError> {
        if let Some(ops) = self.user.get(dtype) {
            return Ok(ops.clone());
        }
        let missing = || TransformError::MissingMarshalling {
            dtype: dtype.clone(),
            what: context.to_string(),
        };
        match dtype {
            DType::F64 => Ok(scalar_ops(dtype.clone())),
            DType::I64 => Ok(scalar_ops(dtype.clone())),
            DType::Bool => Ok(scalar_ops(dtype.clone())),
            DType::Vector(elem, n) => {
                if !elem.is_scalar() {
                    return Err(missing());
                }
                let bytes = n * 8;
                if let Some(limit) = self.lane_limit {
                    if bytes > limit {
                        // One batch's lanes exceed what a single transfer to
                        // this transport can carry; there is no automatic
                        // chunking.
                        return Err(missing());
                    }
                }
                Ok(vector_ops(*n))
            }
            DType::Record(fields) => {
                let parts = fields
                    .iter()
                    .map(|f| {
                        let size = byte_size(f).ok_or_else(missing)?;
                        let ops = self.resolve(f, context)?;
                        Ok((ops, size))
                    })
                    .collect::<Result<Vec<_>, TransformError>>()?;
                Ok(record_ops(parts))
            }
            DType::Named(_) => Err(missing()),
        }
    }
}

/// Fixed byte width of a structurally marshalled type.
pub fn byte_size(dtype: &DType) -> Option<usize> {
    match dtype {
        DType::F64 | DType::I64 => Some(8),
        DType::Bool => Some(1),
        DType::Vector(elem, n) => {
            if elem.is_scalar() {
                Some(n * 8)
            } else {
                None
            }
        }
        DType::Record(fields) => fields.iter().map(byte_size).sum(),
        DType::Named(_) => None,
    }
}

fn scalar_ops(dtype: DType) -> MarshalOps {
    let to_dtype = dtype.clone();
    MarshalOps {
        to_device: Arc::new(move |value| match (&dtype, value) {
            (DType::F64, Value::F64(v)) => Ok(v.to_le_bytes().to_vec()),
            (DType::I64, Value::I64(v)) => Ok(v.to_le_bytes().to_vec()),
            (DType::Bool, Value::Bool(v)) => Ok(vec![u8::from(*v)]),
            (dtype, value) => Err(DeviceError::Marshal(format!(
                "value {value:?} does not have type {dtype}"
            ))),
        }),
        to_host: Arc::new(move |bytes| match &to_dtype {
            DType::F64 => Ok(Value::F64(f64::from_le_bytes(fixed8(bytes)?))),
            DType::I64 => Ok(Value::I64(i64::from_le_bytes(fixed8(bytes)?))),
            DType::Bool => match bytes {
                [b] => Ok(Value::Bool(*b != 0)),
                _ => Err(DeviceError::Marshal(format!(
                    "expected 1 byte for bool, got {}",
                    bytes.len()
                ))),
            },
            other => Err(DeviceError::Marshal(format!(
                "no scalar layout for {other}"
            ))),
        }),
    }
}

fn fixed8(bytes: &[u8]) -> Result<[u8; 8], DeviceError> {
    bytes.try_into().map_err(|_| {
        DeviceError::Marshal(format!("expected 8 bytes for a scalar, got {}", bytes.len()))
    })
}

/// Bulk copy: `n` lanes as one contiguous little-endian block.
fn vector_ops(n: usize) -> MarshalOps {
    MarshalOps {
        to_device: Arc::new(move |value| {
            let lanes = match value {
                Value::Vector(lanes) if lanes.len() == n => lanes,
                other => {
                    return Err(DeviceError::Marshal(format!(
                        "value {other:?} is not a {n}-lane vector"
                    )));
                }
            };
            let mut bytes = Vec::with_capacity(n * 8);
            for lane in lanes.iter() {
                bytes.extend_from_slice(&lane.to_le_bytes());
            }
            Ok(bytes)
        }),
        to_host: Arc::new(move |bytes| {
            if bytes.len() != n * 8 {
                return Err(DeviceError::Marshal(format!(
                    "expected {} bytes for {n} lanes, got {}",
                    n * 8,
                    bytes.len()
                )));
            }
            let lanes: Vec<f64> = bytes
                .chunks_exact(8)
                .map(|chunk| f64::from_le_bytes(chunk.try_into().expect("chunks of 8")))
                .collect();
            Ok(Value::Vector(Array1::from_vec(lanes)))
        }),
    }
}

/// Element-wise copy: each field marshalled by its own pair, concatenated at
/// fixed offsets.
fn record_ops(parts: Vec<(MarshalOps, usize)>) -> MarshalOps {
    let enc = parts.clone();
    MarshalOps {
        to_device: Arc::new(move |value| {
            let fields = match value {
                Value::Record(fields) if fields.len() == enc.len() => fields,
                other => {
                    return Err(DeviceError::Marshal(format!(
                        "value {other:?} is not a {}-field record",
                        enc.len()
                    )));
                }
            };
            let mut bytes = Vec::new();
            for (field, (ops, _)) in fields.iter().zip(&enc) {
                bytes.extend((ops.to_device)(field)?);
            }
            Ok(bytes)
        }),
        to_host: Arc::new(move |bytes| {
            let mut fields = Vec::with_capacity(parts.len());
            let mut offset = 0;
            for (ops, size) in &parts {
                let end = offset + size;
                let chunk = bytes.get(offset..end).ok_or_else(|| {
                    DeviceError::Marshal(format!(
                        "record truncated at byte {offset} of {}",
                        bytes.len()
                    ))
                })?;
                fields.push((ops.to_host)(chunk)?);
                offset = end;
            }
            Ok(Value::Record(fields))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_round_trip() {
        let reg = MarshalRegistry::new();
        let ops = reg.resolve(&DType::F64, "x").unwrap();
        let bytes = (ops.to_device)(&Value::F64(2.5)).unwrap();
        assert_eq!((ops.to_host)(&bytes).unwrap(), Value::F64(2.5));
    }

    #[test]
    fn test_record_layout() {
        let reg = MarshalRegistry::new();
        let dtype = DType::Record(vec![DType::F64, DType::Bool, DType::I64]);
        let ops = reg.resolve(&dtype, "x").unwrap();
        let value = Value::Record(vec![Value::F64(1.0), Value::Bool(true), Value::I64(-4)]);
        let bytes = (ops.to_device)(&value).unwrap();
        assert_eq!(bytes.len(), 17);
        assert_eq!((ops.to_host)(&bytes).unwrap(), value);
    }

    #[test]
    fn test_named_type_requires_user_pair() {
        let reg = MarshalRegistry::new();
        let err = reg
            .resolve(&DType::Named("mesh".into()), "vertices")
            .unwrap_err();
        assert!(matches!(err, TransformError::MissingMarshalling { .. }));
    }

    #[test]
    fn test_lane_limit_bounds_bulk_copies() {
        let reg = MarshalRegistry::new().with_lane_limit(64);
        assert!(reg.resolve(&DType::vector(DType::F64, 8), "x").is_ok());
        let err = reg
            .resolve(&DType::vector(DType::F64, 9), "x")
            .unwrap_err();
        assert!(matches!(err, TransformError::MissingMarshalling { .. }));
    }
}
