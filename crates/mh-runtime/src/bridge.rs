use std::collections::BTreeMap;

use rhai::{Array, Dynamic, EvalAltResult, ImmutableString, Map, Position, FLOAT, INT};

use mh_core::{HostError, HostValue};

use crate::INTERRUPT_SENTINEL;

pub(crate) fn host_value_to_dynamic(value: &HostValue) -> Dynamic {
    match value {
        HostValue::Null => Dynamic::UNIT,
        HostValue::Bool(value) => Dynamic::from_bool(*value),
        HostValue::Number(value) => Dynamic::from_float(*value as FLOAT),
        HostValue::String(value) => Dynamic::from(value.clone()),
        HostValue::Array(values) => {
            let mut array = Array::new();
            for value in values {
                array.push(host_value_to_dynamic(value));
            }
            Dynamic::from_array(array)
        }
        HostValue::Map(values) => {
            let mut map = Map::new();
            for (key, value) in values {
                map.insert(key.clone().into(), host_value_to_dynamic(value));
            }
            Dynamic::from_map(map)
        }
    }
}

pub(crate) fn dynamic_to_host_value(value: Dynamic) -> Result<HostValue, HostError> {
    let value = value.flatten_clone();
    if value.is_unit() {
        return Ok(HostValue::Null);
    }
    if value.is::<bool>() {
        return Ok(HostValue::Bool(value.cast::<bool>()));
    }
    if value.is::<INT>() {
        return Ok(HostValue::Number(value.cast::<INT>() as f64));
    }
    if value.is::<FLOAT>() {
        return Ok(HostValue::Number(value.cast::<FLOAT>()));
    }
    if value.is::<ImmutableString>() {
        return Ok(HostValue::String(value.cast::<ImmutableString>().to_string()));
    }
    if value.is::<char>() {
        return Ok(HostValue::String(value.cast::<char>().to_string()));
    }
    if value.is::<rhai::Blob>() {
        let blob = value.cast::<rhai::Blob>();
        return Ok(HostValue::Array(
            blob.into_iter()
                .map(|byte| HostValue::Number(byte as f64))
                .collect(),
        ));
    }
    if value.is::<Array>() {
        let array = value.cast::<Array>();
        let mut out = Vec::with_capacity(array.len());
        for item in array {
            out.push(dynamic_to_host_value(item)?);
        }
        return Ok(HostValue::Array(out));
    }
    if value.is::<Map>() {
        let map = value.cast::<Map>();
        let mut out = BTreeMap::new();
        for (key, value) in map {
            out.insert(key.to_string(), dynamic_to_host_value(value)?);
        }
        return Ok(HostValue::Map(out));
    }

    Err(HostError::runtime(format!(
        "unsupported script value of type {}",
        value.type_name()
    )))
}

/// Rethrows a host error into the running script so `try`/`catch` can observe
/// it. The original error is kept intact inside the thrown value and is
/// recovered by `unwrap_script_error` when the script leaves it uncaught.
pub(crate) fn throw(error: HostError) -> Box<EvalAltResult> {
    EvalAltResult::ErrorRuntime(Dynamic::from(error), Position::NONE).into()
}

pub(crate) fn unwrap_script_error(error: EvalAltResult) -> HostError {
    match error {
        EvalAltResult::ErrorRuntime(value, position) => {
            if let Some(host_error) = value.clone().try_cast::<HostError>() {
                return host_error;
            }
            let rendered = if value.is::<ImmutableString>() {
                value.cast::<ImmutableString>().to_string()
            } else {
                value.to_string()
            };
            if position.is_none() {
                HostError::runtime(rendered)
            } else {
                HostError::runtime(format!("{} ({})", rendered, position))
            }
        }
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _) => unwrap_script_error(*inner),
        other => HostError::runtime(other.to_string()),
    }
}

pub(crate) fn interrupt_token() -> Dynamic {
    INTERRUPT_SENTINEL.into()
}

pub(crate) fn is_interrupt_sentinel(token: &Dynamic) -> bool {
    token
        .clone()
        .try_cast::<ImmutableString>()
        .map_or(false, |text| text == INTERRUPT_SENTINEL)
}

pub(crate) fn compile_error(filename: &str, error: &rhai::ParseError) -> HostError {
    let position = error.1;
    HostError::Compile {
        filename: filename.to_string(),
        message: error.to_string(),
        line: position.line(),
        column: position.position(),
    }
}
