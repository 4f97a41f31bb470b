pub mod controller;
pub mod dispatcher;
pub mod llm;
pub mod parser;
pub mod playback;
pub mod prompts;
pub mod schema;
pub mod sequencer;
pub mod trigger;
pub mod tts;
pub mod voice;
