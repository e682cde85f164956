//! Chat turn delimiters per base-model family.
//!
//! The same template must be used when formatting training data and when
//! serving the exported artifact; an artifact driven with the wrong turn
//! delimiters produces garbage.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatTemplate {
    /// `<|user|>` / `<|assistant|>` turns closed by `<|end|>`.
    Phi3,
    /// `<|im_start|>role` turns closed by `<|im_end|>`.
    ChatMl,
    /// `<|user|>` / `<|assistant|>` turns closed by `</s>`.
    Zephyr,
}

impl ChatTemplate {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Phi3 => "phi3",
            Self::ChatMl => "chatml",
            Self::Zephyr => "zephyr",
        }
    }

    #[must_use]
    pub fn user_open(self) -> &'static str {
        match self {
            Self::Phi3 | Self::Zephyr => "<|user|>\n",
            Self::ChatMl => "<|im_start|>user\n",
        }
    }

    #[must_use]
    pub fn assistant_open(self) -> &'static str {
        match self {
            Self::Phi3 | Self::Zephyr => "<|assistant|>\n",
            Self::ChatMl => "<|im_start|>assistant\n",
        }
    }

    #[must_use]
    pub fn turn_close(self) -> &'static str {
        match self {
            Self::Phi3 => "<|end|>",
            Self::ChatMl => "<|im_end|>",
            Self::Zephyr => "</s>",
        }
    }

    #[must_use]
    pub fn eos_token(self) -> &'static str {
        match self {
            Self::Phi3 | Self::ChatMl => "<|endoftext|>",
            Self::Zephyr => "</s>",
        }
    }

    /// Tokens the tokenizer must treat atomically.
    #[must_use]
    pub fn special_tokens(self) -> Vec<&'static str> {
        match self {
            Self::Phi3 => vec!["<|endoftext|>", "<|user|>", "<|assistant|>", "<|end|>"],
            Self::ChatMl => vec!["<|endoftext|>", "<|im_start|>", "<|im_end|>"],
            Self::Zephyr => vec!["</s>", "<|user|>", "<|assistant|>"],
        }
    }

    /// Renders one supervised turn: the user instruction and the assistant target.
    #[must_use]
    pub fn render_training_turn(self, instruction: &str, target: &str) -> String {
        format!(
            "{}{}{}\n{}{}{}",
            self.user_open(),
            instruction,
            self.turn_close(),
            self.assistant_open(),
            target,
            self.turn_close()
        )
    }

    /// Renders an inference prompt, ending where the assistant should start writing.
    #[must_use]
    pub fn render_prompt(self, prompt: &str) -> String {
        format!("{}{}{}\n{}", self.user_open(), prompt, self.turn_close(), self.assistant_open())
    }

    /// Go-template form understood by Ollama Modelfiles.
    #[must_use]
    pub fn ollama_template(self) -> String {
        self.render_prompt("{{ .Prompt }}")
    }

    #[must_use]
    pub fn stop_tokens(self) -> Vec<&'static str> {
        let mut stops = vec![self.turn_close()];
        if self.eos_token() != self.turn_close() {
            stops.push(self.eos_token());
        }
        stops
    }
}

impl std::fmt::Display for ChatTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
