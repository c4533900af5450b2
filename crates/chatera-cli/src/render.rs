//! Incremental printing of the message log.
//!
//! The terminal is append-only, so the printer remembers how much of the streaming
//! answer it has already written and prints only what each snapshot adds.

use std::io::{self, Write};

use chatera_core::{AssistantMessage, Message, MessageId, MessageLog};

const DIM: &str = "\x1b[2m";
const RESET: &str = "\x1b[0m";

#[derive(Debug, Default)]
pub struct Printer {
    message: Option<MessageId>,
    printed: String,
    thinking_len: usize,
}

impl Printer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start over, e.g. after switching conversations.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Print the whole log.
    pub fn print_log(&mut self, log: &MessageLog) -> io::Result<()> {
        self.reset();
        let mut out = io::stdout().lock();
        for message in log.iter() {
            match message.as_ref() {
                Message::User(user) => writeln!(out, "> {}", user.text)?,
                Message::Assistant(answer) => {
                    if answer.thinking_visible {
                        for event in &answer.thinking_events {
                            writeln!(out, "{DIM}  ~ {event}{RESET}")?;
                        }
                    }
                    writeln!(out, "{}", answer.text)?;
                    print_code_blocks(&mut out, answer)?;
                }
            }
        }
        out.flush()
    }

    /// Print what the tail assistant message gained since the last call.
    pub fn print_delta(&mut self, log: &MessageLog) -> io::Result<()> {
        let Some(answer) = log.last().and_then(|m| m.as_assistant()) else {
            return Ok(());
        };
        if self.message.as_ref() != Some(&answer.id) {
            self.message = Some(answer.id.clone());
            self.printed.clear();
            self.thinking_len = 0;
        }

        let mut out = io::stdout().lock();
        for event in answer.thinking_events.iter().skip(self.thinking_len) {
            if !self.printed.is_empty() {
                writeln!(out)?;
            }
            writeln!(out, "{DIM}  ~ {event}{RESET}")?;
        }
        self.thinking_len = answer.thinking_events.len();

        match answer.text.strip_prefix(self.printed.as_str()) {
            Some(delta) => write!(out, "{delta}")?,
            // The text was replaced, e.g. by an error message.
            None => write!(out, "\n{}", answer.text)?,
        }
        self.printed.clone_from(&answer.text);
        out.flush()
    }

    /// Close the streamed answer: end the line and list its code blocks.
    pub fn finish(&mut self, log: &MessageLog) -> io::Result<()> {
        self.print_delta(log)?;
        let mut out = io::stdout().lock();
        writeln!(out)?;
        if let Some(answer) = log.last().and_then(|m| m.as_assistant()) {
            print_code_blocks(&mut out, answer)?;
        }
        self.message = None;
        out.flush()
    }
}

fn print_code_blocks(out: &mut impl Write, answer: &AssistantMessage) -> io::Result<()> {
    let surface = if answer.canvas_mode { "canvas" } else { "inline" };
    for block in &answer.code_blocks {
        let lines = block.content.lines().count();
        let preview = if block.is_renderable() { ", renderable" } else { "" };
        writeln!(
            out,
            "  [{surface}{preview}] {} ({}, {lines} lines){}",
            block.suggested_file_name(),
            if block.language.is_empty() { "text" } else { &block.language },
            if block.is_complete { "" } else { ", incomplete" },
        )?;
    }
    Ok(())
}
