use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use crate::error::Result;
use crate::store::Store;
use crate::types::{Contact, ProviderFamily};

pub const WIDGET_PLACEHOLDER_NAME: &str = "Visitante Web";

/// Provider profile lookup used to name first-time contacts.
#[async_trait]
pub trait ProfileFetcher: Send + Sync {
    async fn display_name(
        &self,
        family: ProviderFamily,
        external_id: &str,
        access_token: &str,
    ) -> Result<Option<String>>;
}

pub struct ContactResolver {
    store: Arc<dyn Store>,
    profiles: Arc<dyn ProfileFetcher>,
}

fn clean_name(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Strictly later than `previous`, even when the clock has not moved.
fn next_interaction_at(previous: DateTime<Utc>) -> DateTime<Utc> {
    let now = Utc::now();
    if now > previous {
        now
    } else {
        previous + Duration::microseconds(1)
    }
}

impl ContactResolver {
    pub fn new(store: Arc<dyn Store>, profiles: Arc<dyn ProfileFetcher>) -> Self {
        Self { store, profiles }
    }

    pub async fn find_or_create(
        &self,
        family: ProviderFamily,
        external_id: &str,
        name_hint: Option<&str>,
        access_token: Option<&str>,
    ) -> Result<Contact> {
        let name_hint = clean_name(name_hint);

        if let Some(mut contact) = self.store.find_contact(family, external_id).await? {
            let refreshed_name = if contact.has_name() {
                None
            } else {
                name_hint
            };
            let at = next_interaction_at(contact.last_interaction_at);
            self.store
                .touch_contact(&contact.id, refreshed_name.as_deref(), at)
                .await?;
            contact.last_interaction_at = at;
            if let Some(name) = refreshed_name {
                contact.name = Some(name);
            }
            return Ok(contact);
        }

        let fetched = match access_token.map(str::trim).filter(|t| !t.is_empty()) {
            Some(token) => match self.profiles.display_name(family, external_id, token).await {
                Ok(name) => clean_name(name.as_deref()),
                Err(err) => {
                    warn!(%family, external_id, error = %err, "profile fetch failed; creating contact without it");
                    None
                }
            },
            None => None,
        };

        let name = fetched.or(name_hint).or_else(|| {
            (family == ProviderFamily::Widget).then(|| WIDGET_PLACEHOLDER_NAME.to_string())
        });

        let candidate = Contact::new(family, external_id, name);
        let contact = self.store.insert_contact(&candidate, family).await?;
        if contact.id != candidate.id {
            // Lost a concurrent create; the winner still gets this interaction.
            let at = next_interaction_at(contact.last_interaction_at);
            self.store.touch_contact(&contact.id, None, at).await?;
            return Ok(Contact {
                last_interaction_at: at,
                ..contact
            });
        }
        debug!(%family, external_id, contact_id = %contact.id, "created contact");
        Ok(contact)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::AppError;
    use crate::store::MemoryStore;

    pub(crate) struct StaticProfiles(pub Option<&'static str>);

    #[async_trait]
    impl ProfileFetcher for StaticProfiles {
        async fn display_name(
            &self,
            _family: ProviderFamily,
            _external_id: &str,
            _access_token: &str,
        ) -> Result<Option<String>> {
            Ok(self.0.map(str::to_string))
        }
    }

    struct FailingProfiles;

    #[async_trait]
    impl ProfileFetcher for FailingProfiles {
        async fn display_name(
            &self,
            _family: ProviderFamily,
            _external_id: &str,
            _access_token: &str,
        ) -> Result<Option<String>> {
            Err(AppError::Upstream("graph unavailable".into()))
        }
    }

    fn resolver(store: Arc<MemoryStore>, profiles: impl ProfileFetcher + 'static) -> ContactResolver {
        ContactResolver::new(store, Arc::new(profiles))
    }

    #[tokio::test]
    async fn same_external_id_resolves_to_same_contact() {
        let store = Arc::new(MemoryStore::new());
        let resolver = resolver(store.clone(), StaticProfiles(None));

        let first = resolver
            .find_or_create(ProviderFamily::Whatsapp, "51999888777", Some("Ana"), None)
            .await
            .unwrap();
        let second = resolver
            .find_or_create(ProviderFamily::Whatsapp, "51999888777", None, None)
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert!(second.last_interaction_at > first.last_interaction_at);
        assert_eq!(store.contacts().await.len(), 1);
    }

    #[tokio::test]
    async fn hint_fills_an_empty_name_only() {
        let store = Arc::new(MemoryStore::new());
        let resolver = resolver(store.clone(), StaticProfiles(None));

        resolver
            .find_or_create(ProviderFamily::Messenger, "psid-1", None, None)
            .await
            .unwrap();
        let named = resolver
            .find_or_create(ProviderFamily::Messenger, "psid-1", Some("Luis"), None)
            .await
            .unwrap();
        let kept = resolver
            .find_or_create(ProviderFamily::Messenger, "psid-1", Some("Otro"), None)
            .await
            .unwrap();

        assert_eq!(named.name.as_deref(), Some("Luis"));
        assert_eq!(kept.name.as_deref(), Some("Luis"));
    }

    #[tokio::test]
    async fn fetched_profile_name_wins_over_hint() {
        let store = Arc::new(MemoryStore::new());
        let resolver = resolver(store, StaticProfiles(Some("Maria Perez")));

        let contact = resolver
            .find_or_create(ProviderFamily::Instagram, "ig-1", Some("maria"), Some("token"))
            .await
            .unwrap();

        assert_eq!(contact.name.as_deref(), Some("Maria Perez"));
        assert_eq!(contact.igsid.as_deref(), Some("ig-1"));
    }

    #[tokio::test]
    async fn profile_failure_still_creates_contact() {
        let store = Arc::new(MemoryStore::new());
        let resolver = resolver(store.clone(), FailingProfiles);

        let contact = resolver
            .find_or_create(ProviderFamily::Messenger, "psid-9", None, Some("token"))
            .await
            .unwrap();

        assert!(contact.name.is_none());
        assert_eq!(store.contacts().await.len(), 1);
    }

    #[tokio::test]
    async fn widget_contacts_get_placeholder_name() {
        let store = Arc::new(MemoryStore::new());
        let resolver = resolver(store, StaticProfiles(None));

        let contact = resolver
            .find_or_create(ProviderFamily::Widget, "visitor-1", Some("  "), None)
            .await
            .unwrap();

        assert_eq!(contact.name.as_deref(), Some(WIDGET_PLACEHOLDER_NAME));
    }
}
