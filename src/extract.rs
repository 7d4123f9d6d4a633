//! Variant-specific tensor extraction.
//!
//! Each supported checkpoint layout knows where its tensors live in the
//! object graph. Extraction reads them out, materializes every view into a
//! contiguous buffer, and reports whatever training provenance the checkpoint
//! carries.

use crate::checkpoint::Checkpoint;
use crate::error::Error;
use crate::models::{TensorMap, TrainingInfo, Variant};
use crate::pickle_vm::Value;

/// Pulls the tensors for `variant` out of `checkpoint`.
///
/// Tensors are returned in the order they appear in the checkpoint.
pub fn extract(
    checkpoint: &Checkpoint,
    variant: Variant,
) -> Result<(TensorMap, TrainingInfo), Error> {
    match variant {
        Variant::Embedding => extract_embedding(checkpoint),
        Variant::Vae => extract_vae(checkpoint),
    }
}

/// Textual-inversion embeddings keep a single tensor under
/// `string_to_param["*"]`; it is emitted as `emb_params`.
fn extract_embedding(checkpoint: &Checkpoint) -> Result<(TensorMap, TrainingInfo), Error> {
    let root = checkpoint.root();

    let params = root
        .get("string_to_param")
        .ok_or_else(|| Error::MissingField("string_to_param".to_string()))?;
    let entry = params
        .get("*")
        .ok_or_else(|| Error::MissingField("string_to_param.*".to_string()))?;
    let tensor = match entry {
        Value::Tensor(tensor) => checkpoint.materialize(tensor)?,
        other => {
            return Err(Error::InvalidTensorEntry {
                name: "*".to_string(),
                found: other.type_name().to_string(),
            });
        }
    };

    let mut tensors = TensorMap::new();
    tensors.insert("emb_params".to_string(), tensor);

    let info = TrainingInfo {
        trained_on: root
            .get("sd_checkpoint_name")
            .and_then(Value::as_str)
            .map(str::to_string),
        steps: root.get("step").and_then(Value::as_int),
    };

    Ok((tensors, info))
}

/// Autoencoder checkpoints carry their weights verbatim under `state_dict`.
fn extract_vae(checkpoint: &Checkpoint) -> Result<(TensorMap, TrainingInfo), Error> {
    let root = checkpoint.root();

    let pairs = match root.get("state_dict") {
        Some(Value::Dict(pairs)) => pairs,
        Some(other) => {
            return Err(Error::MissingField(format!(
                "state_dict (found {})",
                other.type_name()
            )));
        }
        None => return Err(Error::MissingField("state_dict".to_string())),
    };

    let mut tensors = TensorMap::new();
    for (key, value) in pairs {
        let name = match key {
            Value::Str(name) => name.clone(),
            other => {
                return Err(Error::InvalidTensorEntry {
                    name: "state_dict".to_string(),
                    found: format!("{} key", other.type_name()),
                });
            }
        };
        let tensor = match value {
            Value::Tensor(tensor) => checkpoint.materialize(tensor)?,
            other => {
                return Err(Error::InvalidTensorEntry {
                    name,
                    found: other.type_name().to_string(),
                });
            }
        };
        tensors.insert(name, tensor);
    }

    // Python dict.get semantics: a present `step` wins even when it is null,
    // only an absent one falls through to `global_step`.
    let steps = match root.get("step") {
        Some(value) => value.as_int(),
        None => root.get("global_step").and_then(Value::as_int),
    };

    let info = TrainingInfo {
        trained_on: None,
        steps,
    };

    Ok((tensors, info))
}
