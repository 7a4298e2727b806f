//! Control contract.
//!
//! Requests carry parameters decoded from a JSON object; success returns a
//! boolean `true` or a result object, failure a negative errno code and a
//! message. This module is the contract only; the transport that carries it
//! belongs to the host.

use std::str::FromStr;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;
use uuid::Uuid;

use crate::array::RaidArray;
use crate::error::{errno, RaidError};
use crate::manager::{CreateParams, RaidManager, RaidOptions};
use crate::types::{RaidLevel, RaidState};

/// Error side of the control contract.
#[derive(Debug)]
pub struct RpcError {
    /// Negative errno.
    pub code: i32,
    pub message: String,
}

impl From<RaidError> for RpcError {
    fn from(err: RaidError) -> Self {
        Self {
            code: err.errno(),
            message: err.to_string(),
        }
    }
}

/// Result side of the control contract.
pub type RpcResult = Result<Value, RpcError>;

fn parse_error(err: impl std::fmt::Display) -> RpcError {
    RpcError {
        code: -errno::EINVAL,
        message: format!("invalid parameters: {err}"),
    }
}

/// Dispatch one control request.
pub async fn dispatch(manager: &Arc<RaidManager>, method: &str, params: Value) -> RpcResult {
    debug!(method, "control request");
    match method {
        "array.list" => array_list(manager, params),
        "array.create" => array_create(manager, params).await,
        "array.delete" => array_delete(manager, params).await,
        "array.add_slot" => array_add_slot(manager, params).await,
        "array.remove_slot" => array_remove_slot(manager, params).await,
        "array.grow" => array_grow(manager, params).await,
        "array.set_options" => array_set_options(manager, params),
        _ => Err(RpcError {
            code: -errno::EINVAL,
            message: format!("unknown method '{method}'"),
        }),
    }
}

fn array_info(array: &Arc<RaidArray>) -> Value {
    let slots: Vec<Value> = array
        .slot_snapshot()
        .iter()
        .map(|slot| {
            json!({
                "name": slot.name,
                "uuid": slot.uuid.map(|uuid| uuid.to_string()),
                "is_configured": slot.is_configured,
                "data_offset": slot.data_offset,
                "data_size": slot.data_size,
            })
        })
        .collect();

    json!({
        "name": array.name(),
        "uuid": array.uuid().to_string(),
        "strip_size_kb": array.strip_size_kb(),
        "state": array.state().to_string(),
        "raid_level": array.level().to_string(),
        "superblock": array.superblock_enabled(),
        "num_base_bdevs": array.num_base_devices(),
        "num_base_bdevs_discovered": array.num_discovered(),
        "num_base_bdevs_operational": array.num_operational(),
        "base_bdevs_list": slots,
    })
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ListParams {
    category: Option<String>,
}

fn array_list(manager: &Arc<RaidManager>, params: Value) -> RpcResult {
    let params: ListParams = serde_json::from_value(params).map_err(parse_error)?;

    let filter = match params.category.as_deref().unwrap_or("all") {
        "all" => None,
        category => Some(RaidState::from_str(category).map_err(RpcError::from)?),
    };

    let arrays: Vec<Value> = manager
        .list_arrays(filter)
        .iter()
        .map(array_info)
        .collect();
    Ok(Value::Array(arrays))
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RpcCreateParams {
    name: String,
    strip_size_kb: Option<u32>,
    raid_level: String,
    base_bdevs: Vec<String>,
    uuid: Option<Uuid>,
    superblock: Option<bool>,
    delta_bitmap: Option<bool>,
}

async fn array_create(manager: &Arc<RaidManager>, params: Value) -> RpcResult {
    let params: RpcCreateParams = serde_json::from_value(params).map_err(parse_error)?;

    let level = RaidLevel::from_str(&params.raid_level).map_err(RpcError::from)?;

    if params.base_bdevs.is_empty() || params.base_bdevs.len() > u8::MAX as usize {
        return Err(RpcError {
            code: -errno::EINVAL,
            message: "base_bdevs must name between 1 and 255 devices".into(),
        });
    }

    if params.delta_bitmap == Some(true) {
        return Err(RpcError {
            code: -errno::EINVAL,
            message: "delta bitmap is not supported by any registered personality".into(),
        });
    }

    manager
        .create_array(CreateParams {
            name: params.name.clone(),
            strip_size_kb: params.strip_size_kb.unwrap_or(0),
            num_base_devices: params.base_bdevs.len() as u8,
            level,
            superblock_enabled: params.superblock.unwrap_or(false),
            uuid: params.uuid,
        })
        .await
        .map_err(RpcError::from)?;

    for (slot, base) in params.base_bdevs.iter().enumerate() {
        match manager.add_base_device_at(&params.name, base, slot).await {
            Ok(()) => {}
            // An absent device is allowed at creation; the slot keeps its
            // name and the examine path binds the device when it appears.
            Err(err) if err.errno() == -errno::ENODEV => {
                debug!(array = %params.name, device = %base, "base device pending");
            }
            Err(err) => {
                if let Err(delete_err) = manager.delete_array(&params.name).await {
                    debug!(array = %params.name, %delete_err, "cleanup delete failed");
                }
                return Err(err.into());
            }
        }
    }

    Ok(json!(true))
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct NameParams {
    name: String,
}

async fn array_delete(manager: &Arc<RaidManager>, params: Value) -> RpcResult {
    let params: NameParams = serde_json::from_value(params).map_err(parse_error)?;
    manager
        .delete_array(&params.name)
        .await
        .map_err(RpcError::from)?;
    Ok(json!(true))
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct AddSlotParams {
    raid_bdev: String,
    base_bdev: String,
}

async fn array_add_slot(manager: &Arc<RaidManager>, params: Value) -> RpcResult {
    let params: AddSlotParams = serde_json::from_value(params).map_err(parse_error)?;
    manager
        .add_base_device(&params.raid_bdev, &params.base_bdev)
        .await
        .map_err(RpcError::from)?;
    Ok(json!(true))
}

async fn array_remove_slot(manager: &Arc<RaidManager>, params: Value) -> RpcResult {
    let params: NameParams = serde_json::from_value(params).map_err(parse_error)?;
    manager
        .remove_base_device(&params.name, None)
        .await
        .map_err(RpcError::from)?;
    Ok(json!(true))
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct GrowParams {
    raid_name: String,
    base_name: String,
}

async fn array_grow(manager: &Arc<RaidManager>, params: Value) -> RpcResult {
    let params: GrowParams = serde_json::from_value(params).map_err(parse_error)?;
    manager
        .grow_base_device(&params.raid_name, &params.base_name)
        .await
        .map_err(RpcError::from)?;
    Ok(json!(true))
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct SetOptionsParams {
    process_window_size_kb: Option<u32>,
    process_max_bandwidth_mb_sec: Option<u32>,
}

fn array_set_options(manager: &Arc<RaidManager>, params: Value) -> RpcResult {
    let params: SetOptionsParams = serde_json::from_value(params).map_err(parse_error)?;

    let mut opts: RaidOptions = manager.options();
    if let Some(window) = params.process_window_size_kb {
        opts.process_window_size_kb = window;
    }
    if let Some(bandwidth) = params.process_max_bandwidth_mb_sec {
        opts.process_max_bandwidth_mb_sec = bandwidth;
    }
    manager.set_options(opts).map_err(RpcError::from)?;
    Ok(json!(true))
}
