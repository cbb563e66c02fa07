/// Submitted commands plus a read cursor. Navigation never edits entries.
#[derive(Debug, Clone, Default)]
pub struct CommandHistory {
    entries: Vec<String>,
    /// `entries.len()` means "at the input line"
    cursor: usize,
    /// Input that was being typed when navigation started
    draft: String,
}

impl CommandHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, command: &str) {
        if command.is_empty() {
            return;
        }
        self.entries.push(command.to_string());
        self.cursor = self.entries.len();
        self.draft.clear();
    }

    /// Step back; `current_input` is remembered when leaving the input line
    pub fn previous(&mut self, current_input: &str) -> Option<&str> {
        if self.cursor == 0 {
            return None;
        }
        if self.cursor == self.entries.len() {
            self.draft = current_input.to_string();
        }
        self.cursor -= 1;
        Some(&self.entries[self.cursor])
    }

    /// Step forward; arriving back at the input line yields the saved draft
    pub fn next(&mut self) -> Option<&str> {
        if self.cursor >= self.entries.len() {
            return None;
        }
        self.cursor += 1;
        if self.cursor == self.entries.len() {
            Some(&self.draft)
        } else {
            Some(&self.entries[self.cursor])
        }
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_navigation_restores_draft() {
        let mut history = CommandHistory::new();
        history.push("ls");
        history.push("df -h");

        assert_eq!(history.previous("tail -f"), Some("df -h"));
        assert_eq!(history.previous("ignored"), Some("ls"));
        assert_eq!(history.previous("ignored"), None);
        assert_eq!(history.next(), Some("df -h"));
        assert_eq!(history.next(), Some("tail -f"));
        assert_eq!(history.next(), None);
        assert_eq!(history.entries(), ["ls", "df -h"]);
    }

    #[test]
    fn test_empty_history_and_push_resets_cursor() {
        let mut history = CommandHistory::new();
        assert_eq!(history.previous("x"), None);
        assert_eq!(history.next(), None);

        history.push("");
        assert!(history.is_empty());

        history.push("a");
        history.push("b");
        history.previous("");
        history.previous("");
        history.push("c");
        assert_eq!(history.previous(""), Some("c"));
        assert_eq!(history.len(), 3);
    }
}
