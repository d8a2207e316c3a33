//! The remap stage interface and a table-driven reference stage.
//!
//! The translation loop treats a [`Stage`] as a pure transformation from one
//! input [`KeyEvent`] to an output [`KeySequence`], plus a query telling it
//! whether any output key is still held down. How the stage decides on its
//! output is its own business.

use crate::error::{Error, Result};
use crate::event::{KeyEvent, KeySequence, KeyState};
use crate::keycode::Key;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A remap engine driven by the translation loop.
pub trait Stage: Sized {
    /// Configuration delivered by the IPC client.
    type Config: DeserializeOwned;

    /// Build a stage from its first configuration.
    fn from_config(config: Self::Config) -> Result<Self>;

    /// Replace the configuration.
    ///
    /// Only called while [`is_output_down`](Stage::is_output_down) is false.
    fn set_config(&mut self, config: Self::Config) -> Result<()>;

    /// Whether any key this stage has emitted is still held down.
    fn is_output_down(&self) -> bool;

    /// Translate one input event.
    fn apply_input(&mut self, event: KeyEvent) -> KeySequence;

    /// Return a sequence previously handed out, so its allocation can be
    /// reused for the next [`apply_input`](Stage::apply_input).
    fn reuse_buffer(&mut self, buffer: KeySequence);
}

/// One entry of a [`MappingConfig`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mapping {
    /// Physical key that triggers the mapping.
    pub input: Key,
    /// Output emitted when the input key is pressed.
    pub output: KeySequence,
}

/// Configuration of a [`MappingStage`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingConfig {
    /// Mappings, at most one per input key.
    #[serde(default)]
    pub mappings: Vec<Mapping>,
}

/// Table-driven stage: each mapped key produces a fixed output sequence.
///
/// Pressing a mapped key emits its output. A repeated press while the
/// mapping's output is held emits nothing if the output is deferred with
/// [`KeyState::OutputOnRelease`], and repeats the press events otherwise.
/// Releasing the key releases every output key the mapping left down.
/// Unmapped keys pass through unchanged.
#[derive(Debug, Default)]
pub struct MappingStage {
    mappings: HashMap<Key, KeySequence>,
    // output keys currently down, with the input key that pressed them
    held: Vec<(Key, Key)>,
    // input keys whose mapping is active
    active: Vec<Key>,
    // output from the OutputOnRelease sentinel on, sent before the next input
    unsent: Vec<(Key, KeyEvent)>,
    spare: KeySequence,
}

impl MappingStage {
    fn load(config: MappingConfig) -> Result<HashMap<Key, KeySequence>> {
        let mut mappings = HashMap::with_capacity(config.mappings.len());
        for mapping in config.mappings {
            if mappings.insert(mapping.input, mapping.output).is_some() {
                return Err(Error::Config(format!(
                    "key {} is mapped more than once",
                    mapping.input
                )));
            }
        }
        Ok(mappings)
    }

    fn track(&mut self, input: Key, event: &KeyEvent) {
        match event.state {
            KeyState::Down => {
                if !self.held.iter().any(|&(_, out)| out == event.key) {
                    self.held.push((input, event.key));
                }
            }
            KeyState::Up => self.held.retain(|&(_, out)| out != event.key),
            KeyState::OutputOnRelease => {}
        }
    }

    /// Deferred output has been sent by the time the next input arrives.
    fn track_unsent(&mut self) {
        let mut unsent = std::mem::take(&mut self.unsent);
        for (input, event) in &unsent {
            self.track(*input, event);
        }
        unsent.clear();
        self.unsent = unsent;
    }

    fn take_buffer(&mut self) -> KeySequence {
        let mut buffer = std::mem::take(&mut self.spare);
        buffer.clear();
        buffer
    }
}

impl Stage for MappingStage {
    type Config = MappingConfig;

    fn from_config(config: MappingConfig) -> Result<Self> {
        Ok(Self {
            mappings: Self::load(config)?,
            ..Self::default()
        })
    }

    fn set_config(&mut self, config: MappingConfig) -> Result<()> {
        self.mappings = Self::load(config)?;
        self.active.clear();
        Ok(())
    }

    fn is_output_down(&self) -> bool {
        !self.held.is_empty()
    }

    fn apply_input(&mut self, event: KeyEvent) -> KeySequence {
        self.track_unsent();
        let mut output = self.take_buffer();
        let Some(mapped) = self.mappings.get(&event.key) else {
            output.push(event);
            self.track(event.key, &event);
            return output;
        };

        match event.state {
            KeyState::Down => {
                let repeated = self.active.contains(&event.key);
                if repeated && mapped.iter().any(KeyEvent::is_output_on_release) {
                    return output;
                }
                if repeated {
                    output.extend(mapped.iter().filter(|e| e.state == KeyState::Down));
                } else {
                    self.active.push(event.key);
                    output.extend(mapped.iter().copied());
                }
            }
            KeyState::Up => {
                self.active.retain(|&k| k != event.key);
                output.extend(
                    self.held
                        .iter()
                        .rev()
                        .filter(|&&(input, _)| input == event.key)
                        .map(|&(_, out)| KeyEvent::up(out)),
                );
            }
            KeyState::OutputOnRelease => {}
        }

        let split = output
            .iter()
            .position(KeyEvent::is_output_on_release)
            .unwrap_or(output.len());
        for index in 0..output.len() {
            let out = output[index];
            if index < split {
                self.track(event.key, &out);
            } else {
                self.unsent.push((event.key, out));
            }
        }
        output
    }

    fn reuse_buffer(&mut self, buffer: KeySequence) {
        if buffer.capacity() > self.spare.capacity() {
            self.spare = buffer;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: Key = Key(30);
    const B: Key = Key(48);
    const C: Key = Key(46);
    const SHIFT: Key = Key(42);

    fn stage(mappings: Vec<Mapping>) -> MappingStage {
        MappingStage::from_config(MappingConfig { mappings }).unwrap()
    }

    #[test]
    fn test_unmapped_keys_pass_through() {
        let mut stage = stage(vec![]);
        assert_eq!(stage.apply_input(KeyEvent::down(A)), vec![KeyEvent::down(A)]);
        assert!(stage.is_output_down());
        assert_eq!(stage.apply_input(KeyEvent::up(A)), vec![KeyEvent::up(A)]);
        assert!(!stage.is_output_down());
    }

    #[test]
    fn test_mapped_key_releases_held_outputs() {
        let mut stage = stage(vec![Mapping {
            input: A,
            output: vec![KeyEvent::down(SHIFT), KeyEvent::down(B)],
        }]);
        assert_eq!(
            stage.apply_input(KeyEvent::down(A)),
            vec![KeyEvent::down(SHIFT), KeyEvent::down(B)]
        );
        assert!(stage.is_output_down());
        assert_eq!(
            stage.apply_input(KeyEvent::up(A)),
            vec![KeyEvent::up(B), KeyEvent::up(SHIFT)]
        );
        assert!(!stage.is_output_down());
    }

    #[test]
    fn test_output_on_release_mapping() {
        let mut stage = stage(vec![Mapping {
            input: A,
            output: vec![
                KeyEvent::output_on_release(),
                KeyEvent::down(B),
                KeyEvent::up(B),
                KeyEvent::down(C),
                KeyEvent::up(C),
            ],
        }]);
        let first = stage.apply_input(KeyEvent::down(A));
        assert_eq!(first.len(), 5);
        assert!(first[0].is_output_on_release());
        assert!(stage.apply_input(KeyEvent::down(A)).is_empty());
        assert!(stage.apply_input(KeyEvent::up(A)).is_empty());
        assert!(!stage.is_output_down());
    }

    #[test]
    fn test_output_after_sentinel_is_tracked_once_sent() {
        let mut stage = stage(vec![Mapping {
            input: A,
            output: vec![
                KeyEvent::down(B),
                KeyEvent::output_on_release(),
                KeyEvent::up(B),
            ],
        }]);
        stage.apply_input(KeyEvent::down(A));
        // B is down until the deferred release goes out
        assert!(stage.is_output_down());
        assert!(stage.apply_input(KeyEvent::up(A)).is_empty());
        assert!(!stage.is_output_down());
    }

    #[test]
    fn test_deferred_press_released_with_input() {
        let mut stage = stage(vec![Mapping {
            input: A,
            output: vec![KeyEvent::output_on_release(), KeyEvent::down(B)],
        }]);
        stage.apply_input(KeyEvent::down(A));
        assert!(!stage.is_output_down());
        assert_eq!(stage.apply_input(KeyEvent::up(A)), vec![KeyEvent::up(B)]);
        assert!(!stage.is_output_down());
    }

    #[test]
    fn test_duplicate_mapping_rejected() {
        let config = MappingConfig {
            mappings: vec![
                Mapping {
                    input: A,
                    output: vec![],
                },
                Mapping {
                    input: A,
                    output: vec![],
                },
            ],
        };
        assert!(matches!(
            MappingStage::from_config(config),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_reuse_buffer_keeps_capacity() {
        let mut stage = stage(vec![]);
        stage.reuse_buffer(Vec::with_capacity(64));
        let out = stage.apply_input(KeyEvent::down(A));
        assert!(out.capacity() >= 64);
    }
}
