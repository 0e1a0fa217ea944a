//! JSON-RPC message helpers and the `initialize` interception.

use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::{Map, Value};

use lsw_types::{
    ETS_CONFIGURATION_METHOD, INITIALIZE_METHOD, SDK_OPTIONS_KEY, SdkPaths, TYPESCRIPT_OPTIONS_KEY,
    TypeScriptOptions,
};

#[derive(Debug, Serialize)]
pub(crate) struct Request<P> {
    pub jsonrpc: &'static str,
    pub id: String,
    pub method: &'static str,
    pub params: P,
}

impl<P> Request<P> {
    pub fn new(id: String, method: &'static str, params: P) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method,
            params,
        }
    }
}

/// Parameters of the ETS configuration request.
#[derive(Debug, Serialize)]
struct EtsConfiguration<'a> {
    typescript: &'a TypeScriptOptions,
    ohos: &'a SdkPaths,
}

/// The `method` of a message, if it has one.
#[must_use]
pub fn method_of(message: &Value) -> Option<&str> {
    message.get("method").and_then(Value::as_str)
}

#[must_use]
pub fn is_initialize(message: &Value) -> bool {
    method_of(message) == Some(INITIALIZE_METHOD)
}

/// The two roots the editor supplies in `initializationOptions`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdkRoots {
    pub tsdk: String,
    pub sdk_path: PathBuf,
}

/// Read the TypeScript and SDK roots from an `initialize` request.
///
/// `typescript.tsdk` and `ohos.sdkPath` win over the top-level `tsdk` and
/// `sdkPath` fallbacks. Empty strings count as absent.
#[must_use]
pub fn sdk_roots(initialize: &Value) -> Option<SdkRoots> {
    let options = initialize.get("params")?.get("initializationOptions")?;

    let lookup = |section: &str, key: &str| {
        options
            .get(section)
            .and_then(|s| s.get(key))
            .or_else(|| options.get(key))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    };

    let tsdk = lookup(TYPESCRIPT_OPTIONS_KEY, "tsdk")?;
    let sdk_path = lookup(SDK_OPTIONS_KEY, "sdkPath")?;
    Some(SdkRoots {
        tsdk: tsdk.to_string(),
        sdk_path: PathBuf::from(sdk_path),
    })
}

/// Rewrite `initializationOptions` to carry the minimized TypeScript options
/// and the discovered SDK paths. Other option keys are kept.
pub fn augment_initialize(
    initialize: &mut Value,
    typescript: &TypeScriptOptions,
    sdk: &SdkPaths,
) -> serde_json::Result<()> {
    let typescript = serde_json::to_value(typescript)?;
    let sdk = serde_json::to_value(sdk)?;

    let Some(params) = initialize.get_mut("params").and_then(Value::as_object_mut) else {
        return Ok(());
    };
    let options = params
        .entry("initializationOptions")
        .or_insert_with(|| Value::Object(Map::new()));
    if !options.is_object() {
        *options = Value::Object(Map::new());
    }
    if let Some(options) = options.as_object_mut() {
        options.insert(TYPESCRIPT_OPTIONS_KEY.to_string(), typescript);
        options.insert(SDK_OPTIONS_KEY.to_string(), sdk);
    }
    Ok(())
}

/// Build the follow-up request the ETS backend waits for after `initialize`.
pub fn configuration_request(
    typescript: &TypeScriptOptions,
    sdk: &SdkPaths,
) -> serde_json::Result<Value> {
    let request = Request::new(
        uuid::Uuid::new_v4().to_string(),
        ETS_CONFIGURATION_METHOD,
        EtsConfiguration {
            typescript,
            ohos: sdk,
        },
    );
    serde_json::to_value(&request)
}

/// Turn one editor `initialize` request into the messages the backend must
/// receive, in order.
///
/// With both roots present this is the augmented request followed by the
/// configuration request. Otherwise the request is passed through unchanged.
pub async fn intercept_initialize(mut initialize: Value) -> Vec<Value> {
    let Some(roots) = sdk_roots(&initialize) else {
        tracing::warn!(
            "initialize carries no typescript.tsdk/ohos.sdkPath; forwarding unchanged"
        );
        return vec![initialize];
    };

    tracing::info!(
        tsdk = %roots.tsdk,
        sdk = %roots.sdk_path.display(),
        "Intercepting initialize"
    );

    let sdk = lsw_sdk::discover(Path::new(&roots.tsdk), &roots.sdk_path).await;
    let typescript = TypeScriptOptions { tsdk: roots.tsdk };

    if let Err(e) = augment_initialize(&mut initialize, &typescript, &sdk) {
        tracing::error!("Failed to augment initialize: {e}");
        return vec![initialize];
    }

    match configuration_request(&typescript, &sdk) {
        Ok(follow_up) => {
            tracing::debug!(
                libraries = sdk.libraries.len(),
                "Sending {ETS_CONFIGURATION_METHOD}"
            );
            vec![initialize, follow_up]
        }
        Err(e) => {
            tracing::error!("Failed to build {ETS_CONFIGURATION_METHOD}: {e}");
            vec![initialize]
        }
    }
}
