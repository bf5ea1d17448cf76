//! Typed request/response envelopes for the vendor open API.

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::error::{Error, Result};

/// Result code the vendor uses for a device that is currently unreachable.
pub const DEVICE_OFFLINE_CODE: i64 = 108;

/// Request envelope: serialized as `{"intent": "...", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "intent", content = "data")]
pub enum Intent {
    #[serde(rename = "query.device.info")]
    QueryDeviceInfo(DeviceInfoQuery),
    #[serde(rename = "query.resource.value")]
    QueryResourceValue(ResourceRequest),
    #[serde(rename = "config.resource.subscribe")]
    ConfigResourceSubscribe(ResourceRequest),
}

impl Intent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::QueryDeviceInfo(_) => "query.device.info",
            Self::QueryResourceValue(_) => "query.resource.value",
            Self::ConfigResourceSubscribe(_) => "config.resource.subscribe",
        }
    }

    pub fn query_resource_value(subject_id: &str, resource_ids: &[String]) -> Self {
        Self::QueryResourceValue(ResourceRequest::single(subject_id, resource_ids))
    }

    pub fn subscribe(subject_id: &str, resource_ids: &[String]) -> Self {
        Self::ConfigResourceSubscribe(ResourceRequest::single(subject_id, resource_ids))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfoQuery {
    pub position_id: String,
    pub page_num: u32,
    pub page_size: u32,
}

impl Default for DeviceInfoQuery {
    fn default() -> Self {
        Self {
            position_id: String::new(),
            page_num: 1,
            page_size: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceRequest {
    pub resources: Vec<ResourceSelector>,
}

impl ResourceRequest {
    fn single(subject_id: &str, resource_ids: &[String]) -> Self {
        Self {
            resources: vec![ResourceSelector {
                subject_id: subject_id.into(),
                resource_ids: resource_ids.to_vec(),
            }],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSelector {
    pub subject_id: String,
    pub resource_ids: Vec<String>,
}

/// Response envelope shared by every intent.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse {
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
}

impl ApiResponse {
    pub fn is_device_offline(&self) -> bool {
        self.code == DEVICE_OFFLINE_CODE
    }

    /// Decode `result` for a successful response.
    ///
    /// Returns `Ok(None)` when the device is offline or the result is absent,
    /// and [`Error::Api`] for any other non-zero code.
    pub fn decode<T: DeserializeOwned>(self, context: &'static str) -> Result<Option<T>> {
        if self.is_device_offline() {
            return Ok(None);
        }
        if self.code != 0 {
            return Err(Error::Api {
                code: self.code,
                message: self.message,
            });
        }
        match self.result {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| Error::parse(context, e)),
        }
    }
}

/// One page of `query.device.info`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfoPage {
    #[serde(default)]
    pub data: Vec<DeviceInfo>,
    #[serde(default)]
    pub total_count: u32,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub did: String,
    #[serde(default)]
    pub device_name: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub position_id: Option<String>,
    #[serde(default)]
    pub state: Option<i64>,
}

/// One entry of `query.resource.value`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceValue {
    pub subject_id: String,
    pub resource_id: String,
    pub value: String,
    #[serde(default)]
    pub time_stamp: Option<i64>,
}

#[cfg(test)]
mod tests {
    use {super::*, serde_json::json};

    #[test]
    fn device_info_envelope_shape() {
        let intent = Intent::QueryDeviceInfo(DeviceInfoQuery::default());
        assert_eq!(
            serde_json::to_value(&intent).unwrap(),
            json!({
                "intent": "query.device.info",
                "data": {"positionId": "", "pageNum": 1, "pageSize": 50}
            })
        );
    }

    #[test]
    fn subscribe_envelope_shape() {
        let intent = Intent::subscribe("lumi.1", &["0.4.85".to_string()]);
        assert_eq!(intent.name(), "config.resource.subscribe");
        assert_eq!(
            serde_json::to_value(&intent).unwrap(),
            json!({
                "intent": "config.resource.subscribe",
                "data": {"resources": [{"subjectId": "lumi.1", "resourceIds": ["0.4.85"]}]}
            })
        );
    }

    #[test]
    fn decode_success_result() {
        let resp: ApiResponse = serde_json::from_value(json!({
            "code": 0,
            "message": "Success",
            "result": [{"subjectId": "lumi.1", "resourceId": "0.4.85", "value": "120"}]
        }))
        .unwrap();
        let values: Vec<ResourceValue> = resp.decode("resource values").unwrap().unwrap();
        assert_eq!(values[0].value, "120");
    }

    #[test]
    fn decode_offline_is_empty() {
        let resp: ApiResponse =
            serde_json::from_value(json!({"code": 108, "message": "device offline"})).unwrap();
        let values: Option<Vec<ResourceValue>> = resp.decode("resource values").unwrap();
        assert!(values.is_none());
    }

    #[test]
    fn decode_other_code_is_api_error() {
        let resp: ApiResponse =
            serde_json::from_value(json!({"code": 302, "message": "missing parameter"})).unwrap();
        let err = resp.decode::<DeviceInfoPage>("device info").unwrap_err();
        assert!(matches!(err, Error::Api { code: 302, .. }));
    }

    #[test]
    fn decode_wrong_shape_is_parse_error() {
        let resp: ApiResponse =
            serde_json::from_value(json!({"code": 0, "result": {"data": "nope"}})).unwrap();
        let err = resp.decode::<DeviceInfoPage>("device info").unwrap_err();
        assert!(matches!(err, Error::Parse { .. }));
    }
}
