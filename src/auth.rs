use async_trait::async_trait;
use log::{info, warn};

use crate::api::client::ApiClient;
use crate::api::models::{Identity, MeResponse, ProfileUpdate, TokenResponse};
use crate::app::AppState;
use crate::error::ApiError;
use crate::storage::Storage;
use crate::store::{self, SharedStore};

#[async_trait]
pub trait AuthBackend: Send + Sync {
    async fn request_otp(&self, email: &str) -> Result<(), ApiError>;
    async fn verify_otp(&self, email: &str, code: &str, name: Option<&str>) -> Result<TokenResponse, ApiError>;
    /// Profile of the user the current token belongs to.
    async fn me(&self) -> Result<MeResponse, ApiError>;
    async fn update_me(&self, update: &ProfileUpdate) -> Result<MeResponse, ApiError>;
}

#[async_trait]
impl AuthBackend for ApiClient {
    async fn request_otp(&self, email: &str) -> Result<(), ApiError> {
        ApiClient::request_otp(self, email).await
    }

    async fn verify_otp(&self, email: &str, code: &str, name: Option<&str>) -> Result<TokenResponse, ApiError> {
        ApiClient::verify_otp(self, email, code, name).await
    }

    async fn me(&self) -> Result<MeResponse, ApiError> {
        ApiClient::me(self).await
    }

    async fn update_me(&self, update: &ProfileUpdate) -> Result<MeResponse, ApiError> {
        ApiClient::update_me(self, update).await
    }
}

pub async fn request_otp(api: &dyn AuthBackend, email: &str) -> Result<(), ApiError> {
    api.request_otp(email.trim()).await?;
    info!("One-time code sent to {}", email.trim());
    Ok(())
}

/// Exchange the code for tokens and record them in `state`. The caller
/// persists `state`.
pub async fn verify_otp(
    api: &dyn AuthBackend,
    state: &mut AppState,
    email: &str,
    code: &str,
    name: Option<&str>,
) -> Result<Identity, ApiError> {
    let email = email.trim();
    let tokens = api.verify_otp(email, code.trim(), name).await?;
    state.store_tokens(&tokens, email);
    info!("Signed in as {}", tokens.user_id);
    Ok(Identity {
        user_id: tokens.user_id,
        email: Some(email.to_string()),
        name: name.map(str::to_string).or_else(|| Some(local_part(email))),
        display_name: None,
        token: tokens.access_token,
    })
}

/// Rebuild the signed-in user from saved credentials. A rejected token
/// signs the user out; any other failure keeps them signed in with what was
/// saved locally.
pub async fn restore_identity(api: &dyn AuthBackend, state: &mut AppState) -> Option<Identity> {
    let (token, user_id) = state.credentials()?;
    let token = token.to_string();
    let user_id = user_id.to_string();

    match api.me().await {
        Ok(me) => Some(Identity {
            user_id,
            email: me.email.or_else(|| state.user_email.clone()),
            name: me.name,
            display_name: me.display_name,
            token,
        }),
        Err(e) if e.is_unauthorized() => {
            warn!("Saved session was rejected: {}", e);
            state.clear_credentials();
            None
        }
        Err(e) => {
            warn!("Could not load profile, using saved details: {}", e);
            let email = state.user_email.clone();
            Some(Identity {
                user_id,
                name: email.as_deref().map(local_part),
                email,
                display_name: None,
                token,
            })
        }
    }
}

/// Forget the signed-in user: credentials and everything cached for them.
pub fn logout(state: &mut AppState, store: &SharedStore) {
    state.clear_credentials();
    store::lock(store).clear();
    info!("Signed out");
}

/// Drop saved credentials and the conversation cache after the server
/// refused them. The caller persists `state`.
pub fn discard_rejected_session(state: &mut AppState, storage: &Storage) {
    state.clear_credentials();
    if let Err(e) = storage.clear() {
        warn!("Could not clear conversation cache: {}", e);
    }
    info!("Discarded rejected session");
}

/// Change our profile on the server and mirror what it accepted into
/// `identity` and `state`.
pub async fn update_profile(
    api: &dyn AuthBackend,
    identity: &mut Identity,
    state: &mut AppState,
    update: &ProfileUpdate,
) -> Result<(), ApiError> {
    let me = api.update_me(update).await?;
    if me.name.is_some() {
        identity.name = me.name;
    }
    if me.display_name.is_some() {
        identity.display_name = me.display_name;
    }
    if let Some(language) = me.language.or_else(|| update.language.clone()) {
        state.language = language;
    }
    info!("Profile updated for {}", identity.user_id);
    Ok(())
}

fn local_part(email: &str) -> String {
    email.split('@').next().unwrap_or_default().to_string()
}
