//! [`Page`] over a Chrome DevTools Protocol tab
//!
//! The document is read by a snapshot script that tags every element with a
//! `data-applier-node` id. A background poller fingerprints the document to
//! turn DOM changes into mutation notifications and fresh documents (a new
//! `window.__applierLoadId`) into load notifications.

use applier_core::{ApplierError, Result};
use async_trait::async_trait;
use headless_chrome::Tab;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, trace};

use crate::dom::{DomSnapshot, NodeId};
use crate::page::Page;

const SNAPSHOT_SCRIPT: &str = r#"(() => {
  if (window.__applierLoadId === undefined) {
    window.__applierLoadId = Math.random().toString(36).slice(2);
  }
  let next = window.__applierNextNode || 1;
  const nodes = [];
  for (const el of document.querySelectorAll('body *')) {
    if (!el.dataset.applierNode) { el.dataset.applierNode = String(next++); }
    const rect = el.getBoundingClientRect();
    const style = getComputedStyle(el);
    const attributes = {};
    for (const a of el.attributes) { attributes[a.name] = a.value; }
    nodes.push({
      id: Number(el.dataset.applierNode),
      tag: el.tagName.toLowerCase(),
      attributes,
      text: (el.innerText || el.textContent || '').trim().slice(0, 500),
      value: typeof el.value === 'string' ? el.value : null,
      visible: rect.width > 0 && rect.height > 0
        && style.visibility !== 'hidden' && style.display !== 'none'
    });
  }
  window.__applierNextNode = next;
  return JSON.stringify({
    url: location.href,
    title: document.title,
    readyState: document.readyState,
    nodes
  });
})()"#;

const FINGERPRINT_SCRIPT: &str = r#"(() => {
  if (window.__applierLoadId === undefined) {
    window.__applierLoadId = Math.random().toString(36).slice(2);
  }
  const body = document.body;
  return JSON.stringify({
    loadId: window.__applierLoadId,
    shape: [
      document.readyState,
      document.getElementsByTagName('*').length,
      body ? body.innerHTML.length : 0
    ].join('|')
  });
})()"#;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Fingerprint {
    load_id: String,
    shape: String,
}

/// Evaluate `script` on the blocking pool and return its JSON value
async fn evaluate(tab: &Arc<Tab>, script: String) -> Result<serde_json::Value> {
    let tab = Arc::clone(tab);
    tokio::task::spawn_blocking(move || {
        tab.evaluate(&script, false)
            .map(|object| object.value.unwrap_or(serde_json::Value::Null))
            .map_err(|e| ApplierError::Browser(format!("JavaScript evaluation failed: {}", e)))
    })
    .await
    .map_err(|e| ApplierError::Browser(format!("Evaluation task failed: {}", e)))?
}

/// Evaluate a script that returns `JSON.stringify(...)` and parse the result
async fn evaluate_json<T: serde::de::DeserializeOwned>(tab: &Arc<Tab>, script: &str) -> Result<T> {
    let value = evaluate(tab, script.to_string()).await?;
    let raw = value
        .as_str()
        .ok_or_else(|| ApplierError::Browser("Script did not return a string".into()))?;
    Ok(serde_json::from_str(raw)?)
}

fn element_script(node: NodeId, body: &str) -> String {
    format!(
        r#"(() => {{
  const el = document.querySelector('[data-applier-node="{}"]');
  if (!el) {{ return false; }}
  {}
  return true;
}})()"#,
        node.0, body
    )
}

/// One Chrome tab
pub struct ChromePage {
    tab: Arc<Tab>,
    mutations: Arc<watch::Sender<u64>>,
    loads: Arc<watch::Sender<u64>>,
    poller: AbortHandle,
}

impl ChromePage {
    /// Wrap `tab` and start fingerprinting it every `poll_interval`
    pub fn attach(tab: Arc<Tab>, poll_interval: Duration) -> Self {
        let (mutations, _) = watch::channel(0);
        let (loads, _) = watch::channel(1);
        let mutations = Arc::new(mutations);
        let loads = Arc::new(loads);

        let poller = tokio::spawn(poll_document(
            Arc::clone(&tab),
            poll_interval,
            Arc::clone(&mutations),
            Arc::clone(&loads),
        ))
        .abort_handle();

        Self {
            tab,
            mutations,
            loads,
            poller,
        }
    }

    pub fn tab(&self) -> &Arc<Tab> {
        &self.tab
    }

    async fn run_on_element(&self, node: NodeId, body: &str) -> Result<()> {
        let found = evaluate(&self.tab, element_script(node, body)).await?;
        if found.as_bool() == Some(true) {
            Ok(())
        } else {
            Err(ApplierError::Browser(format!("Node {} is not attached", node)))
        }
    }
}

impl Drop for ChromePage {
    fn drop(&mut self) {
        self.poller.abort();
        debug!("ChromePage dropped, poller stopped");
    }
}

async fn poll_document(
    tab: Arc<Tab>,
    interval: Duration,
    mutations: Arc<watch::Sender<u64>>,
    loads: Arc<watch::Sender<u64>>,
) {
    let mut last: Option<Fingerprint> = None;
    loop {
        tokio::time::sleep(interval).await;

        let current: Fingerprint = match evaluate_json(&tab, FINGERPRINT_SCRIPT).await {
            Ok(fingerprint) => fingerprint,
            Err(e) => {
                // Expected while a navigation swaps documents
                trace!("Fingerprint unavailable: {}", e);
                continue;
            }
        };

        if let Some(previous) = &last {
            if previous.load_id != current.load_id {
                debug!("New document loaded");
                loads.send_modify(|n| *n += 1);
                mutations.send_modify(|n| *n += 1);
            } else if previous.shape != current.shape {
                mutations.send_modify(|n| *n += 1);
            }
        }
        last = Some(current);
    }
}

#[async_trait]
impl Page for ChromePage {
    async fn snapshot(&self) -> Result<DomSnapshot> {
        evaluate_json(&self.tab, SNAPSHOT_SCRIPT).await
    }

    async fn current_url(&self) -> Result<String> {
        Ok(self.tab.get_url())
    }

    async fn set_value(&self, node: NodeId, value: &str) -> Result<()> {
        let value = serde_json::to_string(value)?;
        let body = format!(
            "el.focus();
  el.value = {};
  el.dispatchEvent(new Event('input', {{ bubbles: true }}));
  el.dispatchEvent(new Event('change', {{ bubbles: true }}));",
            value
        );
        self.run_on_element(node, &body).await
    }

    async fn click(&self, node: NodeId) -> Result<()> {
        self.run_on_element(node, "el.click();").await
    }

    async fn navigate(&self, url: &str) -> Result<()> {
        debug!("Navigating to {}", url);
        let tab = Arc::clone(&self.tab);
        let target = url.to_string();
        tokio::task::spawn_blocking(move || {
            tab.navigate_to(&target)
                .map(|_| ())
                .map_err(|e| ApplierError::Browser(format!("Failed to navigate to {}: {}", target, e)))
        })
        .await
        .map_err(|e| ApplierError::Browser(format!("Navigation task failed: {}", e)))?
    }

    fn mutations(&self) -> watch::Receiver<u64> {
        self.mutations.subscribe()
    }

    fn loads(&self) -> watch::Receiver<u64> {
        self.loads.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_script_targets_node() {
        let script = element_script(NodeId(42), "el.click();");
        assert!(script.contains(r#"[data-applier-node="42"]"#));
        assert!(script.contains("el.click();"));
    }

    #[test]
    fn test_fingerprint_shape() {
        let fingerprint: Fingerprint =
            serde_json::from_str(r#"{"loadId": "abc", "shape": "complete|10|200"}"#).unwrap();
        assert_eq!(fingerprint.load_id, "abc");
    }
}
