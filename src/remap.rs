use std::{collections::BTreeMap, sync::Arc};

use regex::Regex;
use url::Url;

use crate::config::RemapConfig;

/// Caller-supplied rewrite; `None` means "not mine".
pub type RemapFn = Arc<dyn Fn(&Url) -> Option<Url> + Send + Sync>;

/// Rewrites URLs so a log recorded against one environment replays against
/// another.
///
/// Strategies are tried in order: the custom function, the hostname table,
/// then the pattern rules. The first strategy that applies wins and the rest
/// are skipped. The same remapper runs over recorded URLs at index time and
/// over live URLs at match time.
#[derive(Clone, Default)]
pub struct UrlRemapper {
    custom: Option<RemapFn>,
    hosts: BTreeMap<String, String>,
    rules: Vec<RemapRule>,
}

#[derive(Debug, Clone)]
struct RemapRule {
    pattern: Regex,
    replacement: String,
}

impl std::fmt::Debug for UrlRemapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UrlRemapper")
            .field("custom", &self.custom.is_some())
            .field("hosts", &self.hosts)
            .field("rules", &self.rules)
            .finish()
    }
}

impl UrlRemapper {
    pub fn from_config(config: &RemapConfig) -> Result<Self, regex::Error> {
        let rules = config
            .rules
            .iter()
            .map(|rule| {
                Ok(RemapRule {
                    pattern: Regex::new(&rule.pattern)?,
                    replacement: rule.replacement.clone(),
                })
            })
            .collect::<Result<Vec<_>, regex::Error>>()?;
        let hosts = config
            .hosts
            .iter()
            .map(|(from, to)| (from.to_ascii_lowercase(), to.clone()))
            .collect();

        Ok(Self {
            custom: None,
            hosts,
            rules,
        })
    }

    pub fn with_custom(mut self, remap: RemapFn) -> Self {
        self.custom = Some(remap);
        self
    }

    pub fn is_identity(&self) -> bool {
        self.custom.is_none() && self.hosts.is_empty() && self.rules.is_empty()
    }

    pub fn remap(&self, url: &Url) -> Url {
        if let Some(custom) = self.custom.as_ref()
            && let Some(remapped) = custom(url)
        {
            return remapped;
        }

        if let Some(remapped) = self.remap_host(url) {
            return remapped;
        }

        for rule in &self.rules {
            if !rule.pattern.is_match(url.as_str()) {
                continue;
            }
            let replaced = rule.pattern.replace(url.as_str(), rule.replacement.as_str());
            return match Url::parse(&replaced) {
                Ok(remapped) => remapped,
                Err(err) => {
                    tracing::warn!(
                        pattern = %rule.pattern,
                        "remap rule produced an invalid URL; leaving it unchanged: {err}"
                    );
                    url.clone()
                }
            };
        }

        url.clone()
    }

    fn remap_host(&self, url: &Url) -> Option<Url> {
        let host = url.host_str()?.to_ascii_lowercase();
        let target = self.hosts.get(&host)?;

        let (target_host, target_port) = match target.rsplit_once(':') {
            Some((host, port)) => match port.parse::<u16>() {
                Ok(port) => (host, Some(port)),
                Err(_) => (target.as_str(), None),
            },
            None => (target.as_str(), None),
        };

        let mut remapped = url.clone();
        if let Err(err) = remapped.set_host(Some(target_host)) {
            tracing::warn!(from = %host, to = %target, "invalid remap hostname: {err}");
            return None;
        }
        if target_port.is_some() && remapped.set_port(target_port).is_err() {
            tracing::warn!(from = %host, to = %target, "remap port rejected for URL scheme");
            return None;
        }
        Some(remapped)
    }
}
