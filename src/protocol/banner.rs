use std::collections::BTreeSet;
use std::fmt;

const PRODUCT_NAME: &str = "ro.product.name";
const PRODUCT_MODEL: &str = "ro.product.model";
const PRODUCT_DEVICE: &str = "ro.product.device";
const FEATURES: &str = "features";

/// Device identification parsed from the device's CNXN payload.
///
/// The payload looks like
/// `device::ro.product.name=sdk;ro.product.model=Emulator;features=shell_v2,cmd`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Banner {
    /// Connection state prefix: `device`, `recovery`, `sideload`, ...
    pub state: String,
    pub product: Option<String>,
    pub model: Option<String>,
    pub device: Option<String>,
    pub features: BTreeSet<String>,
}

impl Banner {
    /// Parse a banner. Malformed or unknown properties are skipped.
    pub fn parse(banner: &str) -> Self {
        let banner = banner.trim_end_matches('\0');
        let mut result = Banner::default();

        let (state, props) = match banner.split_once("::") {
            Some((state, props)) => (state, props),
            None => (banner, ""),
        };
        result.state = state.to_string();

        for prop in props.split(';') {
            let mut parts = prop.split('=');
            let (Some(key), Some(value), None) = (parts.next(), parts.next(), parts.next()) else {
                continue;
            };
            match key {
                PRODUCT_NAME => result.product = Some(value.to_string()),
                PRODUCT_MODEL => result.model = Some(value.to_string()),
                PRODUCT_DEVICE => result.device = Some(value.to_string()),
                FEATURES => {
                    result.features = value
                        .split(',')
                        .filter(|f| !f.is_empty())
                        .map(str::to_string)
                        .collect();
                }
                _ => {}
            }
        }
        result
    }

    pub fn parse_bytes(payload: &[u8]) -> Self {
        Self::parse(&String::from_utf8_lossy(payload))
    }

    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.contains(feature)
    }
}

impl fmt::Display for Banner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} product={} model={} device={}",
            self.state,
            self.product.as_deref().unwrap_or("?"),
            self.model.as_deref().unwrap_or("?"),
            self.device.as_deref().unwrap_or("?"),
        )
    }
}

/// The host's CNXN payload: `host::features=a,b,c`.
pub fn host_banner<S: AsRef<str>>(features: &[S]) -> String {
    let features: Vec<&str> = features.iter().map(AsRef::as_ref).collect();
    format!("host::features={}", features.join(","))
}
