use crate::casing::capitalize_first;
use crate::error::{RenderError, RenderResult};
use crate::request::NarrationTrack;
use crate::timeline::Schedule;

pub const TARGET_BLOCK_WORDS: usize = 23;
pub const MAX_BLOCK_WORDS: usize = 26;

pub fn split_narration(text: &str, parts: usize) -> Vec<String> {
    let words: Vec<&str> = text.split_whitespace().collect();
    if parts == 0 {
        return Vec::new();
    }
    if words.is_empty() {
        return vec![String::new(); parts];
    }

    let sizes = balanced_sizes(words.len(), parts);
    let mut blocks = Vec::with_capacity(parts);
    let mut cursor = 0;
    for size in sizes {
        blocks.push(words[cursor..cursor + size].join(" "));
        cursor += size;
    }

    if words.len() <= TARGET_BLOCK_WORDS * parts {
        blocks.iter().map(|block| capitalize_first(block)).collect()
    } else {
        blocks.iter().map(|block| normalize_block(block)).collect()
    }
}

pub fn balanced_sizes(total: usize, parts: usize) -> Vec<usize> {
    if parts == 0 {
        return Vec::new();
    }
    let base = total / parts;
    let rem = total % parts;
    (0..parts)
        .map(|index| base + usize::from(index < rem))
        .collect()
}

pub fn normalize_block(raw: &str) -> String {
    let words: Vec<&str> = raw.split_whitespace().take(MAX_BLOCK_WORDS).collect();
    if words.is_empty() {
        return String::new();
    }
    let mut sentence = words.join(" ");
    if !sentence.ends_with(['.', '!', '?', '…']) {
        sentence.push('.');
    }
    capitalize_first(&sentence)
}

pub fn check_alignment(track: &NarrationTrack, schedule: &Schedule) -> RenderResult<()> {
    let tolerance = schedule.frame_interval() + 1e-9;
    let slots = schedule.tickers();
    for segment in &track.segments {
        let slot = slots.get(segment.slot).ok_or_else(|| {
            RenderError::validation(format!(
                "narration segment references slot {} but the schedule has {}",
                segment.slot,
                slots.len()
            ))
        })?;
        let drift = (segment.start_secs - slot.start).abs();
        if drift > tolerance {
            return Err(RenderError::validation(format!(
                "narration segment for slot {} starts at {:.3}s but the slot starts at {:.3}s (drift {:.3}s exceeds one frame)",
                segment.slot, segment.start_secs, slot.start, drift
            )));
        }
    }

    let total = schedule.total_duration();
    if (track.total_duration_secs - total).abs() > tolerance {
        tracing::warn!(
            narration_secs = track.total_duration_secs,
            render_secs = total,
            "narration length differs from render duration; it will be trimmed or padded"
        );
    }
    Ok(())
}

pub fn aligned_segment_starts(schedule: &Schedule) -> Vec<f64> {
    schedule.tickers().iter().map(|slot| slot.start).collect()
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::config::TimingConfig;
    use crate::request::{NarrationSegment, TemplateKind};

    fn words(count: usize) -> String {
        (0..count)
            .map(|index| format!("w{index}"))
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[test]
    fn remainder_goes_to_earliest_blocks() {
        assert_eq!(balanced_sizes(10, 3), vec![4, 3, 3]);
        assert_eq!(balanced_sizes(11, 3), vec![4, 4, 3]);
        assert_eq!(balanced_sizes(2, 3), vec![1, 1, 0]);
    }

    #[test]
    fn short_text_is_split_without_truncation() {
        let blocks = split_narration("  flood  waters rose over the valley overnight ", 3);
        assert_eq!(
            blocks,
            vec!["Flood waters rose", "Over the", "Valley overnight"]
        );
    }

    #[test]
    fn long_text_blocks_are_normalized() {
        let blocks = split_narration(&words(90), 3);
        assert_eq!(blocks.len(), 3);
        for block in &blocks {
            assert_eq!(block.split_whitespace().count(), MAX_BLOCK_WORDS);
            assert!(block.ends_with('.'));
            assert!(block.starts_with('W'));
        }
    }

    #[test]
    fn empty_text_gives_empty_blocks() {
        assert_eq!(split_narration(" \n ", 3), vec!["", "", ""]);
    }

    #[test]
    fn normalize_keeps_existing_terminator() {
        assert_eq!(normalize_block("is it over?"), "Is it over?");
        assert_eq!(normalize_block("storm passed"), "Storm passed.");
        assert_eq!(normalize_block("   "), "");
    }

    fn track(starts: &[(usize, f64)]) -> NarrationTrack {
        NarrationTrack {
            path: PathBuf::from("voice.m4a"),
            total_duration_secs: 35.0,
            segments: starts
                .iter()
                .map(|&(slot, start_secs)| NarrationSegment { slot, start_secs })
                .collect(),
        }
    }

    #[test]
    fn alignment_allows_one_frame_of_drift() {
        let schedule = Schedule::new(TemplateKind::NewsSequence, &TimingConfig::default(), 30);
        let starts = aligned_segment_starts(&schedule);
        assert_eq!(starts[0], 2.0);

        let ok = track(&[(0, 2.0), (1, starts[1] + 0.02), (2, starts[2] - 0.033)]);
        check_alignment(&ok, &schedule).expect("within one frame");

        let late = track(&[(1, starts[1] + 0.05)]);
        let err = check_alignment(&late, &schedule).unwrap_err();
        assert!(err.to_string().contains("exceeds one frame"));

        let missing = track(&[(3, 30.0)]);
        assert!(check_alignment(&missing, &schedule).is_err());
    }
}
