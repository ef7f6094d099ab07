use std::future::Future;
use std::pin::Pin;

/// Translation collaborator used to normalize inbound and outbound chat.
/// Pure pass-through dependency; the core owns no translation state.
pub trait Translator: Send + Sync {
    fn translate<'a>(
        &'a self,
        text: &'a str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + 'a>>;
}

/// Identity translator for deployments that chat in the model's language.
pub struct Identity;

impl Translator for Identity {
    fn translate<'a>(
        &'a self,
        text: &'a str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + 'a>> {
        Box::pin(async move { Ok(text.to_string()) })
    }
}
