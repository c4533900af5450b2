//! Slash-command parsing.

/// One line of user input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Plain text: send it as a message.
    Send(String),
    /// `/list`
    List,
    /// `/open <n|id>`
    Open(String),
    /// `/new`
    New,
    /// `/rename <n|id> <title>`
    Rename(String, String),
    /// `/pin <n|id>`
    Pin(String),
    /// `/delete <n|id>`
    Delete(String),
    /// `/docs`
    Docs,
    /// `/use [doc-id ...]`
    Use(Vec<String>),
    /// `/forget <doc-id ...>`
    Forget(Vec<String>),
    /// `/upload` or `/upload stop`
    Upload { stop: bool },
    /// `/thinking`
    Thinking,
    /// `/help`
    Help,
    /// `/quit`
    Quit,
}

pub const HELP: &str = "\
commands:
  /list                  list conversations (pinned first)
  /open <n|id>           open a conversation
  /new                   start a new conversation
  /rename <n|id> <title> rename a conversation
  /pin <n|id>            pin or unpin a conversation
  /delete <n|id>         delete a conversation
  /docs                  list documents
  /use [doc-id ...]      ground answers on documents (no ids clears)
  /forget <doc-id ...>   delete documents
  /upload [stop]         open or close an upload progress channel
  /thinking              show or hide the last answer's thinking trace
  /quit                  exit
anything else is sent as a message; Ctrl-C stops a streaming answer
and exits when no answer is streaming";

impl Command {
    /// Parse a line. Returns `None` for blank input.
    ///
    /// # Errors
    ///
    /// Returns a usage message for unknown commands or missing arguments.
    pub fn parse(line: &str) -> Result<Option<Self>, String> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        let Some(rest) = line.strip_prefix('/') else {
            return Ok(Some(Self::Send(line.to_string())));
        };

        let (name, args) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
        let args = args.trim();
        let words = || args.split_whitespace().map(str::to_string).collect::<Vec<_>>();
        let target = |usage: &str| {
            if args.is_empty() {
                Err(format!("usage: {usage}"))
            } else {
                Ok(args.to_string())
            }
        };

        let command = match name {
            "list" | "ls" => Self::List,
            "open" => Self::Open(target("/open <n|id>")?),
            "new" => Self::New,
            "rename" => {
                let (id, title) = args
                    .split_once(char::is_whitespace)
                    .ok_or("usage: /rename <n|id> <title>")?;
                Self::Rename(id.to_string(), title.trim().to_string())
            }
            "pin" => Self::Pin(target("/pin <n|id>")?),
            "delete" | "rm" => Self::Delete(target("/delete <n|id>")?),
            "docs" => Self::Docs,
            "use" => Self::Use(words()),
            "forget" => {
                target("/forget <doc-id ...>")?;
                Self::Forget(words())
            }
            "upload" => Self::Upload {
                stop: args == "stop",
            },
            "thinking" => Self::Thinking,
            "help" | "?" => Self::Help,
            "quit" | "exit" | "q" => Self::Quit,
            other => return Err(format!("unknown command /{other}, try /help")),
        };
        Ok(Some(command))
    }
}
