//! Authentication and authorization hooks
//!
//! Auth and ACL policy live outside the core; connections call through
//! this trait at CONNECT, PUBLISH and SUBSCRIBE. The default
//! implementation allows everything, which is also the behavior when no
//! policy collaborator is configured.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::protocol::QoS;

/// Hook error; mapped by callers onto "unspecified error" reason codes.
pub type HookError = Box<dyn std::error::Error + Send + Sync>;

/// Policy delegation points for a broker.
#[async_trait]
pub trait Hooks: Send + Sync {
    /// Authenticate a connecting client. `Ok(false)` refuses with "not
    /// authorized".
    async fn authenticate(
        &self,
        client_id: &str,
        username: Option<&str>,
        password: Option<&Bytes>,
    ) -> Result<bool, HookError> {
        let _ = (client_id, username, password);
        Ok(true)
    }

    /// Authorize a PUBLISH to `topic`.
    async fn allow_publish(
        &self,
        client_id: &str,
        username: Option<&str>,
        topic: &str,
        qos: QoS,
        retain: bool,
    ) -> Result<bool, HookError> {
        let _ = (client_id, username, topic, qos, retain);
        Ok(true)
    }

    /// Authorize a SUBSCRIBE to `filter`.
    async fn allow_subscribe(
        &self,
        client_id: &str,
        username: Option<&str>,
        filter: &str,
    ) -> Result<bool, HookError> {
        let _ = (client_id, username, filter);
        Ok(true)
    }
}

/// Allow-everything policy.
pub struct AllowAll;

#[async_trait]
impl Hooks for AllowAll {}

/// Chain of hooks; every link must allow.
pub struct HookChain {
    links: Vec<Arc<dyn Hooks>>,
}

impl Default for HookChain {
    fn default() -> Self {
        Self::new()
    }
}

impl HookChain {
    pub fn new() -> Self {
        Self { links: Vec::new() }
    }

    pub fn with(mut self, hook: Arc<dyn Hooks>) -> Self {
        self.links.push(hook);
        self
    }
}

#[async_trait]
impl Hooks for HookChain {
    async fn authenticate(
        &self,
        client_id: &str,
        username: Option<&str>,
        password: Option<&Bytes>,
    ) -> Result<bool, HookError> {
        for link in &self.links {
            if !link.authenticate(client_id, username, password).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn allow_publish(
        &self,
        client_id: &str,
        username: Option<&str>,
        topic: &str,
        qos: QoS,
        retain: bool,
    ) -> Result<bool, HookError> {
        for link in &self.links {
            if !link
                .allow_publish(client_id, username, topic, qos, retain)
                .await?
            {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn allow_subscribe(
        &self,
        client_id: &str,
        username: Option<&str>,
        filter: &str,
    ) -> Result<bool, HookError> {
        for link in &self.links {
            if !link.allow_subscribe(client_id, username, filter).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DenyTopic(&'static str);

    #[async_trait]
    impl Hooks for DenyTopic {
        async fn allow_publish(
            &self,
            _client_id: &str,
            _username: Option<&str>,
            topic: &str,
            _qos: QoS,
            _retain: bool,
        ) -> Result<bool, HookError> {
            Ok(topic != self.0)
        }
    }

    #[tokio::test]
    async fn default_allows_everything() {
        let hooks = AllowAll;
        assert!(hooks.authenticate("c", None, None).await.unwrap());
        assert!(hooks
            .allow_publish("c", None, "t", QoS::AtMostOnce, false)
            .await
            .unwrap());
        assert!(hooks.allow_subscribe("c", None, "#").await.unwrap());
    }

    #[tokio::test]
    async fn chain_denies_when_any_link_denies() {
        let chain = HookChain::new()
            .with(Arc::new(AllowAll))
            .with(Arc::new(DenyTopic("secret")));
        assert!(chain
            .allow_publish("c", None, "open", QoS::AtMostOnce, false)
            .await
            .unwrap());
        assert!(!chain
            .allow_publish("c", None, "secret", QoS::AtMostOnce, false)
            .await
            .unwrap());
    }
}
