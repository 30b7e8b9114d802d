use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use unicode_segmentation::UnicodeSegmentation;

use crate::{
    error::{CapabilityError, SyncError},
    navigation::{Direction, NavigationController},
};

const NEXT_KEYWORDS: [&str; 3] = ["siguiente", "proximo", "avanzar"];
const PREVIOUS_KEYWORDS: [&str; 3] = ["anterior", "atras", "retroceder"];

/// One recognition result. Interim results of the same utterance share an
/// `utterance_id` and grow until the final one arrives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptEvent {
    pub utterance_id: u64,
    pub text: String,
    pub is_final: bool,
}

impl TranscriptEvent {
    pub fn interim(utterance_id: u64, text: impl Into<String>) -> Self {
        Self {
            utterance_id,
            text: text.into(),
            is_final: false,
        }
    }

    pub fn final_result(utterance_id: u64, text: impl Into<String>) -> Self {
        Self {
            utterance_id,
            text: text.into(),
            is_final: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenConfig {
    pub continuous: bool,
    pub locale: String,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            continuous: true,
            locale: "es-MX".to_string(),
        }
    }
}

/// Speech-to-text provider. `start_listening` may fail with a
/// [`CapabilityError`] wrapped in the returned error.
#[async_trait]
pub trait SpeechFacility: Send + Sync {
    async fn capabilities(&self) -> Result<(), CapabilityError>;
    async fn start_listening(
        &self,
        config: &ListenConfig,
    ) -> anyhow::Result<mpsc::Receiver<TranscriptEvent>>;
    async fn stop_listening(&self) -> anyhow::Result<()>;
}

/// Maps a transcript to a navigation direction. The first keyword in the
/// text wins; matching ignores case and accents.
pub fn parse_command(text: &str) -> Option<Direction> {
    text.unicode_words().find_map(|word| {
        let word = fold_word(word);
        if NEXT_KEYWORDS.contains(&word.as_str()) {
            Some(Direction::Next)
        } else if PREVIOUS_KEYWORDS.contains(&word.as_str()) {
            Some(Direction::Previous)
        } else {
            None
        }
    })
}

fn fold_word(word: &str) -> String {
    word.chars()
        .flat_map(char::to_lowercase)
        .filter(|c| !is_combining_mark(*c))
        .map(|c| match c {
            'á' | 'à' | 'ä' | 'â' => 'a',
            'é' | 'è' | 'ë' | 'ê' => 'e',
            'í' | 'ì' | 'ï' | 'î' => 'i',
            'ó' | 'ò' | 'ö' | 'ô' => 'o',
            'ú' | 'ù' | 'ü' | 'û' => 'u',
            other => other,
        })
        .collect()
}

/// Combining diacritical marks, as left by decomposed (NFD) transcripts.
fn is_combining_mark(c: char) -> bool {
    ('\u{0300}'..='\u{036F}').contains(&c)
}

pub struct VoiceCommandBridge {
    navigator: Arc<NavigationController>,
    state: Mutex<BridgeState>,
}

#[derive(Default)]
struct BridgeState {
    last_fired_utterance: Option<u64>,
    disabled: Option<CapabilityError>,
}

impl VoiceCommandBridge {
    pub fn new(navigator: Arc<NavigationController>) -> Self {
        Self {
            navigator,
            state: Mutex::new(BridgeState::default()),
        }
    }

    /// The capability error that switched the bridge off, if any.
    pub async fn disabled_reason(&self) -> Option<CapabilityError> {
        self.state.lock().await.disabled.clone()
    }

    /// Navigates at most once per utterance. Returns the direction that was
    /// forwarded, or `None` when the transcript held no command, the
    /// utterance already fired, or the bridge is disabled.
    pub async fn handle_transcript(
        &self,
        event: &TranscriptEvent,
    ) -> Result<Option<Direction>, SyncError> {
        let Some(direction) = parse_command(&event.text) else {
            return Ok(None);
        };
        {
            let mut state = self.state.lock().await;
            if state.disabled.is_some() {
                return Ok(None);
            }
            if state.last_fired_utterance == Some(event.utterance_id) {
                debug!(
                    utterance_id = event.utterance_id,
                    is_final = event.is_final,
                    "voice command already handled for utterance"
                );
                return Ok(None);
            }
            state.last_fired_utterance = Some(event.utterance_id);
        }

        info!(
            utterance_id = event.utterance_id,
            ?direction,
            text = %event.text,
            "voice command"
        );
        self.navigator.navigate(direction).await?;
        Ok(Some(direction))
    }

    /// Listens on `facility` until its transcript stream ends. A capability
    /// error is returned once and turns the bridge off; later calls return
    /// immediately.
    pub async fn run(
        &self,
        facility: &dyn SpeechFacility,
        config: ListenConfig,
    ) -> Result<(), SyncError> {
        if let Some(reason) = self.disabled_reason().await {
            debug!(%reason, "voice bridge disabled; not listening");
            return Ok(());
        }

        if let Err(err) = facility.capabilities().await {
            return Err(self.disable(err).await);
        }

        let mut transcripts = match facility.start_listening(&config).await {
            Ok(transcripts) => transcripts,
            Err(error) => {
                if let Some(err) = error.downcast_ref::<CapabilityError>() {
                    return Err(self.disable(err.clone()).await);
                }
                warn!(%error, "failed to start listening");
                return Err(CapabilityError::Unavailable(error.to_string()).into());
            }
        };
        info!(locale = %config.locale, continuous = config.continuous, "listening for voice commands");

        while let Some(event) = transcripts.recv().await {
            if let Err(error) = self.handle_transcript(&event).await {
                warn!(utterance_id = event.utterance_id, %error, "voice navigation failed");
            }
        }

        if let Err(error) = facility.stop_listening().await {
            warn!(%error, "failed to stop listening");
        }
        info!("transcript stream ended");
        Ok(())
    }

    async fn disable(&self, err: CapabilityError) -> SyncError {
        warn!(error = %err, "speech recognition unavailable; disabling voice commands");
        self.state.lock().await.disabled = Some(err.clone());
        SyncError::Capability(err)
    }
}

#[cfg(test)]
#[path = "tests/voice_tests.rs"]
mod tests;
