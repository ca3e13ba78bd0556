//! Deployment configuration.
//!
//! Everything here is decided at build or provisioning time and baked into
//! the firmware image. The core consumes `machine_id`; the connectivity
//! fields are carried for the WiFi, HTTP, mDNS and syslog collaborators so
//! the whole deployment reads from one record.

pub struct Config {
    /// Identifies this machine to the backend ledger.
    pub machine_id: &'static str,
    /// Fallback API base URL, used when mDNS resolution fails.
    pub api_base_url: &'static str,
    /// Sent as `X-API-Key` on every backend call.
    pub api_key: &'static str,
    /// Hostname resolved via mDNS at startup to find the backend.
    pub mdns_hostname: &'static str,
    pub syslog_host: &'static str,
    pub syslog_port: u16,
    pub wifi_ssid: &'static str,
    pub wifi_password: &'static str,
    pub ota_manifest_url: &'static str,
}
