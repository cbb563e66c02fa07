/// Append-only text capped at `max_chars`; the oldest text is dropped first.
///
/// Dropped text is skipped by advancing `start` and only compacted away once
/// it makes up half the allocation, so a push costs O(pushed + dropped).
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    text: String,
    start: usize,
    chars: usize,
    max_chars: usize,
}

impl OutputBuffer {
    pub fn new(max_chars: usize) -> Self {
        Self {
            text: String::new(),
            start: 0,
            chars: 0,
            max_chars: max_chars.max(1),
        }
    }

    pub fn push(&mut self, text: &str) {
        self.text.push_str(text);
        self.chars += text.chars().count();

        if self.chars > self.max_chars {
            let excess = self.chars - self.max_chars;
            let live = &self.text[self.start..];
            let cut = live
                .char_indices()
                .nth(excess)
                .map_or(live.len(), |(idx, _)| idx);
            self.start += cut;
            self.chars = self.max_chars;

            if self.start * 2 >= self.text.len() {
                self.text.drain(..self.start);
                self.start = 0;
            }
        }
    }

    pub fn as_str(&self) -> &str {
        &self.text[self.start..]
    }

    pub fn len_chars(&self) -> usize {
        self.chars
    }

    pub fn is_empty(&self) -> bool {
        self.chars == 0
    }

    pub fn clear(&mut self) {
        self.text.clear();
        self.start = 0;
        self.chars = 0;
    }
}
