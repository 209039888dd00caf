use crate::auth::{AuthScheme, AuthTarget, ChallengeMatch};
use crate::secure::RustlsLayer;
use crate::transport::ConnectOptions;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxySettings {
    pub host: String,
    pub port: u16,
    pub timeout_secs: u64,
    /// `ip:port` to bind locally before connecting; port 0 picks any.
    pub source_address: Option<String>,
}

impl Default for ProxySettings {
    fn default() -> Self {
        ProxySettings {
            host: "127.0.0.1".to_string(),
            port: 8080,
            timeout_secs: 30,
            source_address: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TlsSettings {
    /// PEM file with extra trust anchors, e.g. an inspecting proxy's CA.
    pub ca_file: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub proxy: ProxySettings,
    pub auth: AuthScheme,
    pub tls: TlsSettings,
    pub targets: Vec<String>,
    pub settings: Settings,
}

// ---------------------------------------------------------------------------
// ClientConfig implementation
// ---------------------------------------------------------------------------

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            proxy: ProxySettings::default(),
            auth: AuthScheme::default(),
            tls: TlsSettings::default(),
            targets: vec![
                "http://example.com/".to_string(),
                "https://example.com/".to_string(),
            ],
            settings: Settings::default(),
        }
    }
}

impl ClientConfig {
    /// Transport options for a connection to the configured proxy.
    pub fn connect_options(&self) -> Result<ConnectOptions> {
        let mut options = ConnectOptions::new(self.proxy.host.clone(), self.proxy.port);
        if self.proxy.timeout_secs > 0 {
            options = options.with_timeout(Duration::from_secs(self.proxy.timeout_secs));
        }
        if let Some(src) = &self.proxy.source_address {
            let addr: SocketAddr = src
                .parse()
                .map_err(|e| anyhow!("Invalid source_address '{}': {}", src, e))?;
            options = options.with_source_address(addr);
        }
        Ok(options)
    }

    /// TLS layer trusting the Mozilla roots plus `tls.ca_file` if set.
    pub fn secure_layer(&self) -> Result<RustlsLayer> {
        let layer = match &self.tls.ca_file {
            Some(path) => RustlsLayer::with_extra_ca(Path::new(path))?,
            None => RustlsLayer::with_webpki_roots()?,
        };
        Ok(layer)
    }

    /// Load configuration from an XML file.
    pub fn load_from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow!("Failed to read config file '{}': {}", path, e))?;
        Self::from_xml(&content)
    }

    /// Save configuration to an XML file.
    pub fn save_to_file(&self, path: &str) -> Result<()> {
        let xml = self.to_xml()?;
        let mut file = std::fs::File::create(path)
            .map_err(|e| anyhow!("Failed to create config file '{}': {}", path, e))?;
        file.write_all(xml.as_bytes())
            .map_err(|e| anyhow!("Failed to write config file: {}", e))?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // XML serialization
    // -----------------------------------------------------------------------

    pub fn to_xml(&self) -> Result<String> {
        let mut out = String::new();
        out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        out.push_str("<webcorp>\n");

        out.push_str("  <settings>\n");
        out.push_str(&format!("    <log_level>{}</log_level>\n", xml_escape(&self.settings.log_level)));
        out.push_str("  </settings>\n");

        out.push_str(&format!(
            "  <proxy host=\"{}\" port=\"{}\" timeout_secs=\"{}\"",
            xml_escape(&self.proxy.host),
            self.proxy.port,
            self.proxy.timeout_secs
        ));
        if let Some(src) = &self.proxy.source_address {
            out.push_str(&format!(" source_address=\"{}\"", xml_escape(src)));
        }
        out.push_str("/>\n");

        out.push_str(&format!(
            "  <auth scheme=\"{}\" target=\"{}\" challenge_match=\"{}\"/>\n",
            xml_escape(&self.auth.name),
            self.auth.target.as_str(),
            self.auth.challenge_match.as_str()
        ));

        match &self.tls.ca_file {
            Some(ca) => out.push_str(&format!("  <tls ca_file=\"{}\"/>\n", xml_escape(ca))),
            None => out.push_str("  <tls/>\n"),
        }

        out.push_str("  <targets>\n");
        for t in &self.targets {
            out.push_str(&format!("    <target url=\"{}\"/>\n", xml_escape(t)));
        }
        out.push_str("  </targets>\n");

        out.push_str("</webcorp>\n");
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // XML deserialization (manual quick-xml reader)
    // -----------------------------------------------------------------------

    pub fn from_xml(xml: &str) -> Result<Self> {
        use quick_xml::events::{BytesStart, Event};
        use quick_xml::Reader;

        fn attributes(e: &BytesStart) -> Result<Vec<(String, String)>> {
            let mut out = Vec::new();
            for attr in e.attributes().flatten() {
                let key = std::str::from_utf8(attr.key.as_ref())?.to_string();
                let val = attr.unescape_value()?.to_string();
                out.push((key, val));
            }
            Ok(out)
        }

        let mut config = ClientConfig::default();
        config.targets.clear();
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut buf = Vec::new();
        let mut current_section = String::new();
        let mut current_text_tag = String::new();

        loop {
            buf.clear();
            let (e, is_empty) = match reader.read_event_into(&mut buf) {
                Ok(Event::Start(e)) => (e.into_owned(), false),
                Ok(Event::Empty(e)) => (e.into_owned(), true),
                Ok(Event::Text(e)) => {
                    if current_section == "settings" && !current_text_tag.is_empty() {
                        let text = e.unescape()?.to_string();
                        if current_text_tag == "log_level" {
                            config.settings.log_level = text;
                        }
                        current_text_tag.clear();
                    }
                    continue;
                }
                Ok(Event::End(e)) => {
                    let name = std::str::from_utf8(e.name().as_ref())?.to_string();
                    if name == current_section {
                        current_section.clear();
                    }
                    continue;
                }
                Ok(Event::Eof) => break,
                Err(e) => return Err(anyhow!("XML parse error: {}", e)),
                _ => continue,
            };

            let name = std::str::from_utf8(e.name().as_ref())?.to_string();
            match name.as_str() {
                "settings" | "targets" if !is_empty => {
                    current_section = name.clone();
                }
                "proxy" => {
                    for (key, val) in attributes(&e)? {
                        match key.as_str() {
                            "host" => config.proxy.host = val,
                            "port" => {
                                config.proxy.port = val
                                    .parse()
                                    .map_err(|_| anyhow!("Invalid proxy port: {}", val))?
                            }
                            "timeout_secs" => config.proxy.timeout_secs = val.parse()?,
                            "source_address" if !val.is_empty() => config.proxy.source_address = Some(val),
                            _ => {}
                        }
                    }
                }
                "auth" => {
                    for (key, val) in attributes(&e)? {
                        match key.as_str() {
                            "scheme" => config.auth.name = val,
                            "target" => config.auth.target = AuthTarget::from_str(&val)?,
                            "challenge_match" => config.auth.challenge_match = ChallengeMatch::from_str(&val)?,
                            _ => {}
                        }
                    }
                }
                "tls" => {
                    for (key, val) in attributes(&e)? {
                        if key == "ca_file" && !val.is_empty() {
                            config.tls.ca_file = Some(val);
                        }
                    }
                }
                "target" if current_section == "targets" => {
                    for (key, val) in attributes(&e)? {
                        if key == "url" {
                            config.targets.push(val);
                        }
                    }
                }
                tag if current_section == "settings" && !is_empty => {
                    current_text_tag = tag.to_string();
                }
                _ => {}
            }
        }

        if config.auth.name.trim().is_empty() {
            return Err(anyhow!("auth scheme must not be empty"));
        }
        Ok(config)
    }
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
