//! `${placeholder}` substitution for sink topics and URLs.

/// Values available to topic and URL templates.
#[derive(Clone, Copy, Debug)]
pub struct Substitutions<'a> {
    pub filename: &'a str,
    pub node_id: &'a str,
    pub hostname: &'a str,
}

impl Substitutions<'_> {
    /// Replace `${filename}`, `${node_id}` and `${hostname}`. Other text is kept as is.
    pub fn apply(&self, template: &str) -> String {
        template
            .replace("${filename}", self.filename)
            .replace("${node_id}", self.node_id)
            .replace("${hostname}", self.hostname)
    }
}

/// Resolve only `${hostname}`, leaving the per-message placeholders in place.
pub fn resolve_hostname(template: &str, hostname: &str) -> String {
    template.replace("${hostname}", hostname)
}

/// Hostname of this machine, or `"unknown"` if it cannot be read.
pub fn local_hostname() -> String {
    match hostname::get() {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(e) => {
            log::warn!("cannot read hostname: {}", e);
            "unknown".to_string()
        }
    }
}
