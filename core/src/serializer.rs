//! Encoding of the inbound HTTP envelope for child processes.
//!
//! The packet travels as JSON inside the `OPWIRE_REQUEST` environment
//! variable; decoders on the child side parse it back into the same shape.

use std::collections::BTreeMap;

use hyper::HeaderMap;
use hyper::Method;
use hyper::Uri;
use serde::Deserialize;
use serde::Serialize;

use crate::error::AgentErr;

/// Environment variable carrying the serialized request.
pub const OPWIRE_REQUEST: &str = "OPWIRE_REQUEST";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestPacket {
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub header: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub query: BTreeMap<String, Vec<String>>,
    /// Path variables captured by a resource URL pattern; `null` when the
    /// request came in through the generic exec URL.
    #[serde(default)]
    pub params: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReqSerializer;

impl ReqSerializer {
    pub fn new() -> Self {
        Self
    }

    pub fn encode(
        &self,
        method: &Method,
        uri: &Uri,
        headers: &HeaderMap,
        params: Option<&BTreeMap<String, String>>,
    ) -> Result<String, AgentErr> {
        let packet = RequestPacket {
            method: method.as_str().to_string(),
            path: uri.path().to_string(),
            header: header_multimap(headers),
            query: query_multimap(uri.query().unwrap_or_default()),
            params: params.cloned(),
        };
        Ok(serde_json::to_string(&packet)?)
    }

    pub fn decode(&self, data: &str) -> Result<RequestPacket, AgentErr> {
        Ok(serde_json::from_str(data)?)
    }
}

fn header_multimap(headers: &HeaderMap) -> BTreeMap<String, Vec<String>> {
    let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in headers {
        map.entry(name.as_str().to_string())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    map
}

fn query_multimap(query: &str) -> BTreeMap<String, Vec<String>> {
    let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        map.entry(key.into_owned())
            .or_default()
            .push(value.into_owned());
    }
    map
}
