use anyhow::{anyhow, Result};
use async_trait::async_trait;
use client_core::{CapabilityError, ListenConfig, SpeechFacility, TranscriptEvent};
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

/// Speech facility fed by the console's `say` command: every typed phrase is
/// one final transcript.
pub struct ConsoleSpeech {
    transcripts: Mutex<Option<mpsc::Receiver<TranscriptEvent>>>,
}

pub struct ConsoleMicrophone {
    tx: mpsc::Sender<TranscriptEvent>,
    next_utterance: u64,
}

impl ConsoleSpeech {
    pub fn new() -> (Self, ConsoleMicrophone) {
        let (tx, rx) = mpsc::channel(16);
        (
            Self {
                transcripts: Mutex::new(Some(rx)),
            },
            ConsoleMicrophone {
                tx,
                next_utterance: 1,
            },
        )
    }
}

impl ConsoleMicrophone {
    pub async fn say(&mut self, text: &str) -> Result<()> {
        let event = TranscriptEvent::final_result(self.next_utterance, text);
        self.next_utterance += 1;
        self.tx
            .send(event)
            .await
            .map_err(|_| anyhow!("voice commands are not being listened to"))
    }
}

#[async_trait]
impl SpeechFacility for ConsoleSpeech {
    async fn capabilities(&self) -> Result<(), CapabilityError> {
        Ok(())
    }

    async fn start_listening(
        &self,
        config: &ListenConfig,
    ) -> Result<mpsc::Receiver<TranscriptEvent>> {
        debug!(locale = %config.locale, "console speech listening");
        self.transcripts
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow!(CapabilityError::Unavailable("console is already listening".to_string())))
    }

    async fn stop_listening(&self) -> Result<()> {
        Ok(())
    }
}
