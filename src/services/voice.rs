use crate::core::state::{Gender, Speaker};
use crate::services::tts::{AudioConfig, VoiceProfile};
use log::{debug, info};
use rand::seq::IndexedRandom;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
struct VoiceTable {
    narrator: Option<VoiceProfile>,
    characters: HashMap<String, VoiceProfile>,
    /// `unique_id`s of every voice handed out this session.
    claimed: HashSet<String>,
}

/// Session-scoped, sticky speaker-to-voice mapping.
#[derive(Debug)]
pub struct VoiceAssigner {
    narrators: Vec<VoiceProfile>,
    characters: Vec<VoiceProfile>,
    default_voice: VoiceProfile,
    table: Mutex<VoiceTable>,
}

impl VoiceAssigner {
    pub fn new(
        narrators: Vec<VoiceProfile>,
        characters: Vec<VoiceProfile>,
        default_voice: VoiceProfile,
    ) -> Self {
        Self {
            narrators,
            characters,
            default_voice,
            table: Mutex::new(VoiceTable::default()),
        }
    }

    pub fn from_config(config: &AudioConfig) -> Self {
        Self::new(
            config.narrators.clone(),
            config.characters.clone(),
            config.default_voice.clone(),
        )
    }

    pub fn default_voice(&self) -> &VoiceProfile {
        &self.default_voice
    }

    fn lock(&self) -> MutexGuard<'_, VoiceTable> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns the sticky voice for `speaker`, choosing one on first use.
    pub fn assign(&self, speaker: &Speaker) -> VoiceProfile {
        let mut table = self.lock();
        match speaker {
            Speaker::Narrator => {
                if let Some(voice) = &table.narrator {
                    return voice.clone();
                }
                // Narrators draw from their own pool, then the character pool.
                let pool = if self.narrators.is_empty() {
                    &self.characters
                } else {
                    &self.narrators
                };
                let voice = self.choose(pool, None, &table.claimed);
                info!("Narrator voice: {}", voice.voice);
                table.claimed.insert(voice.unique_id());
                table.narrator = Some(voice.clone());
                voice
            }
            Speaker::Character { name, gender } => {
                if let Some(voice) = table.characters.get(name) {
                    return voice.clone();
                }
                let voice = self.choose(&self.characters, *gender, &table.claimed);
                info!("Voice for character '{}': {}", name, voice.voice);
                table.claimed.insert(voice.unique_id());
                table.characters.insert(name.clone(), voice.clone());
                voice
            }
        }
    }

    fn choose(
        &self,
        pool: &[VoiceProfile],
        gender: Option<Gender>,
        claimed: &HashSet<String>,
    ) -> VoiceProfile {
        let mut candidates: Vec<&VoiceProfile> = match gender {
            Some(g) => pool.iter().filter(|v| v.gender == Some(g)).collect(),
            None => Vec::new(),
        };
        if candidates.is_empty() {
            candidates = pool.iter().collect();
        }

        let unclaimed: Vec<&VoiceProfile> = candidates
            .iter()
            .copied()
            .filter(|v| !claimed.contains(&v.unique_id()))
            .collect();
        if !unclaimed.is_empty() {
            candidates = unclaimed;
        } else if !candidates.is_empty() {
            debug!("Voice pool exhausted, reusing a claimed voice");
        }

        let mut rng = rand::rng();
        candidates
            .choose(&mut rng)
            .map(|v| (*v).clone())
            .unwrap_or_else(|| self.default_voice.clone())
    }
}
