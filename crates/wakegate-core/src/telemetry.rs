use serde::{Deserialize, Serialize};

/// Environmental and device-health readings attached to a wake cycle.
///
/// All values are already normalized: temperature is Celsius regardless of
/// what the firmware sent.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryReading {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature_c: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub humidity: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pressure: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gas_resistance: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery_voltage: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wifi_rssi: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl TelemetryReading {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Overlay `other` onto `self`, keeping existing values `other` lacks.
    pub fn merge(&mut self, other: &TelemetryReading) {
        macro_rules! take {
            ($($f:ident),+) => {
                $(if other.$f.is_some() {
                    self.$f = other.$f.clone();
                })+
            };
        }
        take!(
            temperature_c,
            humidity,
            pressure,
            gas_resistance,
            battery_voltage,
            wifi_rssi,
            location
        );
    }
}

pub fn fahrenheit_to_celsius(f: f64) -> f64 {
    (f - 32.0) * 5.0 / 9.0
}
