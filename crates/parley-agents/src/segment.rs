use parley_common::SegmentKind;

/// Output of feeding one delta through the segmenter, in stream order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentEvent {
    Text(SegmentKind, String),
    EnterThinking,
    ExitThinking,
}

/// Splits streamed text into thinking and answer segments delimited by an
/// open/close marker pair. Markers may be split across deltas, so a suffix
/// that could still become a marker is held back until the next delta.
#[derive(Debug, Clone)]
pub struct ThinkSegmenter {
    open: String,
    close: String,
    thinking: bool,
    pending: String,
}

impl ThinkSegmenter {
    pub fn new(open: impl Into<String>, close: impl Into<String>) -> Self {
        Self {
            open: open.into(),
            close: close.into(),
            thinking: false,
            pending: String::new(),
        }
    }

    pub fn is_thinking(&self) -> bool {
        self.thinking
    }

    fn kind(&self) -> SegmentKind {
        if self.thinking {
            SegmentKind::Thinking
        } else {
            SegmentKind::Answer
        }
    }

    fn enabled(&self) -> bool {
        !self.open.is_empty() && !self.close.is_empty()
    }

    pub fn push(&mut self, delta: &str) -> Vec<SegmentEvent> {
        let mut events = Vec::new();
        if !self.enabled() {
            if !delta.is_empty() {
                events.push(SegmentEvent::Text(SegmentKind::Answer, delta.to_string()));
            }
            return events;
        }

        self.pending.push_str(delta);
        loop {
            let marker = if self.thinking {
                self.close.clone()
            } else {
                self.open.clone()
            };

            if let Some(pos) = self.pending.find(&marker) {
                if pos > 0 {
                    events.push(SegmentEvent::Text(self.kind(), self.pending[..pos].to_string()));
                }
                self.pending.drain(..pos + marker.len());
                self.thinking = !self.thinking;
                events.push(if self.thinking {
                    SegmentEvent::EnterThinking
                } else {
                    SegmentEvent::ExitThinking
                });
                continue;
            }

            let held = partial_marker_len(&self.pending, &marker);
            let ready = self.pending.len() - held;
            if ready > 0 {
                events.push(SegmentEvent::Text(self.kind(), self.pending[..ready].to_string()));
                self.pending.drain(..ready);
            }
            return events;
        }
    }

    /// Release anything held back. Called once the stream has ended.
    pub fn flush(&mut self) -> Option<SegmentEvent> {
        if self.pending.is_empty() {
            return None;
        }
        let text = std::mem::take(&mut self.pending);
        Some(SegmentEvent::Text(self.kind(), text))
    }
}

/// Length of the longest suffix of `text` that is a proper prefix of `marker`.
fn partial_marker_len(text: &str, marker: &str) -> usize {
    let max = marker.len().saturating_sub(1).min(text.len());
    (1..=max)
        .rev()
        .find(|&k| {
            let start = text.len() - k;
            text.is_char_boundary(start) && marker.starts_with(&text[start..])
        })
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segmenter() -> ThinkSegmenter {
        ThinkSegmenter::new("<think>", "</think>")
    }

    #[test]
    fn splits_thinking_from_answer_in_one_delta() {
        let mut seg = segmenter();
        assert_eq!(
            seg.push("<think>A</think>B"),
            vec![
                SegmentEvent::EnterThinking,
                SegmentEvent::Text(SegmentKind::Thinking, "A".into()),
                SegmentEvent::ExitThinking,
                SegmentEvent::Text(SegmentKind::Answer, "B".into()),
            ]
        );
        assert!(seg.flush().is_none());
    }

    #[test]
    fn holds_back_marker_split_across_deltas() {
        let mut seg = segmenter();
        assert_eq!(
            seg.push("hi <th"),
            vec![SegmentEvent::Text(SegmentKind::Answer, "hi ".into())]
        );
        assert_eq!(
            seg.push("ink>plan</"),
            vec![
                SegmentEvent::EnterThinking,
                SegmentEvent::Text(SegmentKind::Thinking, "plan".into()),
            ]
        );
        assert!(seg.is_thinking());
        assert_eq!(seg.push("thin"), vec![]);
        assert_eq!(seg.push("k>done"), vec![
            SegmentEvent::ExitThinking,
            SegmentEvent::Text(SegmentKind::Answer, "done".into()),
        ]);
    }

    #[test]
    fn false_marker_prefix_is_released() {
        let mut seg = segmenter();
        assert_eq!(seg.push("a <"), vec![SegmentEvent::Text(SegmentKind::Answer, "a ".into())]);
        assert_eq!(
            seg.push("b"),
            vec![SegmentEvent::Text(SegmentKind::Answer, "<b".into())]
        );
    }

    #[test]
    fn flush_emits_held_text_in_current_mode() {
        let mut seg = segmenter();
        seg.push("<think>x <");
        assert_eq!(
            seg.flush(),
            Some(SegmentEvent::Text(SegmentKind::Thinking, "<".into()))
        );
    }

    #[test]
    fn multibyte_text_is_not_split_mid_char() {
        let mut seg = ThinkSegmenter::new("«t»", "«/t»");
        assert_eq!(
            seg.push("héllo «"),
            vec![SegmentEvent::Text(SegmentKind::Answer, "héllo ".into())]
        );
        assert_eq!(
            seg.push("t»é"),
            vec![
                SegmentEvent::EnterThinking,
                SegmentEvent::Text(SegmentKind::Thinking, "é".into()),
            ]
        );
    }

    #[test]
    fn empty_markers_disable_segmentation() {
        let mut seg = ThinkSegmenter::new("", "");
        assert_eq!(
            seg.push("<think>a"),
            vec![SegmentEvent::Text(SegmentKind::Answer, "<think>a".into())]
        );
    }
}
