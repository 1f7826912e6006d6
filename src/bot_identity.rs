//! Lazy resolution of the bot's committer identity (§4.3 "Staging"): the primary
//! authenticated email plus a display name, fetched once and reused for the life of the
//! process.

use parking_lot::Mutex;

use crate::forge::{ForgeClient, Signature};
use crate::Result;

pub struct BotIdentityCache {
    cached: Mutex<Option<Signature>>,
}

impl BotIdentityCache {
    pub fn new() -> Self {
        BotIdentityCache {
            cached: Mutex::new(None),
        }
    }

    pub async fn get<C: ForgeClient + ?Sized>(&self, client: &C, login: &str) -> Result<Signature> {
        if let Some(sig) = self.cached.lock().clone() {
            return Ok(sig);
        }
        let emails = client.get_authenticated_emails().await?;
        let email = emails
            .into_iter()
            .next()
            .unwrap_or_else(|| format!("{}@users.noreply.github.com", login));
        let name = client.get_user_display_name(login).await?;
        let sig = Signature { name, email };
        *self.cached.lock() = Some(sig.clone());
        Ok(sig)
    }
}

impl Default for BotIdentityCache {
    fn default() -> Self {
        Self::new()
    }
}
