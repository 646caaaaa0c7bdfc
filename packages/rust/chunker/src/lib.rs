//! Chapter-aware text chunker.
//!
//! Splits a novel along chapter headings into groups of at most
//! `max_chapters` chapters, then windows each group into chunks of at most
//! `max_chars` characters. Consecutive chunks of one group share exactly
//! `overlap` characters; chunks of different groups abut.
//!
//! Offsets are in characters, never bytes, so a chunk never splits a CJK
//! character.

pub mod chapters;

use tracing::{debug, instrument, warn};

use novelkb_shared::{Chunk, NovelKbError, Result};

pub use chapters::{ChapterSpan, VolumeSpan, WHOLE_TEXT_TITLE, find_chapters, find_volumes};

#[derive(Debug, Clone)]
pub struct ChunkerConfig {
    /// Character cap per chunk.
    pub max_chars: usize,
    /// Characters repeated at the start of each follow-up chunk in a group.
    pub overlap: usize,
    /// Chapters per group (0 = all selected chapters form one group).
    pub max_chapters: usize,
    /// Only chunk the first N chapters (0 = all).
    pub chapter_limit: usize,
    /// Stop after N chunks (0 = all).
    pub max_chunks: usize,
    /// Only chunk the N-th `第N卷` volume (0 = whole text).
    pub volume: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            max_chars: 2800,
            overlap: 200,
            max_chapters: 0,
            chapter_limit: 0,
            max_chunks: 0,
            volume: 0,
        }
    }
}

/// Output of one chunking run.
#[derive(Debug, Clone)]
pub struct Chunking {
    pub chunks: Vec<Chunk>,
    /// Chapters found in the selected text.
    pub chapters_detected: usize,
    /// Chapters that made it into the selection.
    pub chapters_used: usize,
    /// Title of the selected volume, if one was selected.
    pub volume_title: Option<String>,
}

pub struct Chunker {
    config: ChunkerConfig,
}

impl Chunker {
    /// Validate `config` and build a chunker.
    pub fn new(config: ChunkerConfig) -> Result<Self> {
        if config.max_chars == 0 {
            return Err(NovelKbError::config("max_chars must be greater than zero"));
        }
        if config.overlap >= config.max_chars {
            return Err(NovelKbError::config(format!(
                "overlap ({}) must be smaller than max_chars ({})",
                config.overlap, config.max_chars
            )));
        }
        Ok(Self { config })
    }

    /// Chunk `text`. Deterministic: equal inputs give equal boundaries.
    #[instrument(skip_all, fields(chars = tracing::field::Empty))]
    pub fn chunk_text(&self, text: &str) -> Chunking {
        // Byte offset of every char index, plus the end of the text.
        let offsets: Vec<usize> = text
            .char_indices()
            .map(|(b, _)| b)
            .chain(std::iter::once(text.len()))
            .collect();
        let total_chars = offsets.len() - 1;
        tracing::Span::current().record("chars", total_chars);

        let (selection, volume_title) = self.select_volume(text);
        let (sel_start, sel_end) = selection;

        // Chapters of the selection, shifted back to whole-text offsets.
        let mut chapters = find_chapters(&text[offsets[sel_start]..offsets[sel_end]]);
        for chapter in &mut chapters {
            chapter.char_start += sel_start;
            chapter.char_end += sel_start;
        }
        let chapters_detected = chapters.len();
        if self.config.chapter_limit > 0 {
            chapters.truncate(self.config.chapter_limit);
        }

        let group_size = match self.config.max_chapters {
            0 => chapters.len().max(1),
            n => n,
        };

        let mut chunks = Vec::new();

        'groups: for group in chapters.chunks(group_size) {
            let (Some(first), Some(last)) = (group.first(), group.last()) else {
                continue;
            };
            let (group_start, group_end) = (first.char_start, last.char_end);
            let mut start = group_start;
            let mut part_index = 1;

            while start < group_end {
                let end = (start + self.config.max_chars).min(group_end);
                let chapter_start = chapter_at(group, start);
                let chapter_end = chapter_at(group, end - 1);

                chunks.push(Chunk {
                    id: format!("{:06}", chunks.len()),
                    chapter_start: chapter_start.index,
                    chapter_end: chapter_end.index,
                    chapter_title: chapter_start.title.clone(),
                    part_index,
                    char_start: start,
                    char_end: end,
                    text: text[offsets[start]..offsets[end]].to_string(),
                });

                if self.config.max_chunks > 0 && chunks.len() >= self.config.max_chunks {
                    break 'groups;
                }
                if end == group_end {
                    break;
                }
                start = end - self.config.overlap;
                part_index += 1;
            }
        }

        debug!(
            chunks = chunks.len(),
            chapters_detected,
            chapters_used = chapters.len(),
            "chunking complete"
        );

        Chunking {
            chunks,
            chapters_detected,
            chapters_used: chapters.len(),
            volume_title,
        }
    }

    /// Character range to chunk, plus the volume title when `volume` selects one.
    /// An unknown volume falls back to the whole text.
    fn select_volume(&self, text: &str) -> ((usize, usize), Option<String>) {
        let whole = (0, text.chars().count());
        if self.config.volume == 0 {
            return (whole, None);
        }
        let volumes = find_volumes(text);
        match volumes.into_iter().nth(self.config.volume - 1) {
            Some(v) => {
                debug!(volume = v.index, title = %v.title, "selected volume");
                ((v.char_start, v.char_end), Some(v.title))
            }
            None => {
                warn!(volume = self.config.volume, "volume not found, chunking the whole text");
                (whole, None)
            }
        }
    }
}

/// The chapter of `group` containing character `pos`.
fn chapter_at(group: &[ChapterSpan], pos: usize) -> &ChapterSpan {
    let idx = group.partition_point(|c| c.char_start <= pos);
    &group[idx.saturating_sub(1)]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunker(max_chars: usize, overlap: usize, max_chapters: usize) -> Chunker {
        Chunker::new(ChunkerConfig {
            max_chars,
            overlap,
            max_chapters,
            ..Default::default()
        })
        .unwrap()
    }

    /// Three chapters of exactly `chapter_chars` characters each.
    fn novel(chapter_chars: usize) -> String {
        let mut text = String::new();
        for (i, title) in ["第1章 离乡", "第2章 拜师", "第3章 修炼"].iter().enumerate() {
            let heading = format!("{title}\n");
            // Body ends with a newline so the next heading starts its own line.
            let fill = chapter_chars - heading.chars().count() - 1;
            text.push_str(&heading);
            let ch = ['王', '林', '仙'][i];
            text.extend(std::iter::repeat_n(ch, fill));
            text.push('\n');
        }
        text
    }

    /// Concatenate chunks, dropping the part each chunk shares with its predecessor.
    fn reconstruct(chunks: &[Chunk]) -> String {
        let mut out = String::new();
        let mut covered: usize = 0;
        for chunk in chunks {
            let skip = covered.saturating_sub(chunk.char_start);
            out.extend(chunk.text.chars().skip(skip));
            covered = chunk.char_end;
        }
        out
    }

    #[test]
    fn rejects_bad_config() {
        let err = Chunker::new(ChunkerConfig {
            max_chars: 200,
            overlap: 200,
            ..Default::default()
        })
        .err()
        .unwrap();
        assert!(matches!(err, NovelKbError::Config { .. }));

        assert!(
            Chunker::new(ChunkerConfig {
                max_chars: 0,
                overlap: 0,
                ..Default::default()
            })
            .is_err()
        );
    }

    #[test]
    fn three_chapters_nine_thousand_chars_gives_four_chunks() {
        let text = novel(3000);
        assert_eq!(text.chars().count(), 9000);

        let out = chunker(2800, 200, 0).chunk_text(&text);
        let spans: Vec<(usize, usize)> =
            out.chunks.iter().map(|c| (c.char_start, c.char_end)).collect();
        assert_eq!(spans, vec![(0, 2800), (2600, 5400), (5200, 8000), (7800, 9000)]);
        assert_eq!(out.chapters_detected, 3);

        assert_eq!(out.chunks[0].chapter_start, 1);
        assert_eq!(out.chunks[1].chapter_start, 1);
        assert_eq!(out.chunks[1].chapter_end, 2);
        assert_eq!(out.chunks[3].chapter_end, 3);
        assert_eq!(out.chunks[3].part_index, 4);
        assert_eq!(reconstruct(&out.chunks), text);
    }

    #[test]
    fn chunk_bounds_and_overlap() {
        let text = novel(3000);
        let out = chunker(2800, 200, 0).chunk_text(&text);

        for chunk in &out.chunks {
            assert!(chunk.char_len() <= 2800);
            assert_eq!(chunk.text.chars().count(), chunk.char_len());
        }
        for pair in out.chunks.windows(2) {
            let shared = pair[0].char_end - pair[1].char_start;
            assert_eq!(shared, 200);
            let tail: String = pair[0].text.chars().skip(pair[0].char_len() - 200).collect();
            let head: String = pair[1].text.chars().take(200).collect();
            assert_eq!(tail, head);
        }
    }

    #[test]
    fn groups_split_on_chapter_boundaries() {
        let text = novel(3000);
        let out = chunker(2800, 200, 1).chunk_text(&text);

        // Each 3000-char chapter becomes two chunks; groups do not overlap.
        assert_eq!(out.chunks.len(), 6);
        for chunk in &out.chunks {
            assert_eq!(chunk.chapter_start, chunk.chapter_end);
        }
        assert_eq!(out.chunks[1].char_end, 3000);
        assert_eq!(out.chunks[2].char_start, 3000);
        assert_eq!(out.chunks[2].part_index, 1);
        assert_eq!(out.chunks[2].chapter_title, "第2章 拜师");
        assert_eq!(reconstruct(&out.chunks), text);
    }

    #[test]
    fn deterministic() {
        let text = novel(1234);
        let a = chunker(500, 50, 2).chunk_text(&text);
        let b = chunker(500, 50, 2).chunk_text(&text);
        assert_eq!(a.chunks, b.chunks);
        assert_eq!(reconstruct(&a.chunks), text);
    }

    #[test]
    fn chapter_limit_and_max_chunks() {
        let text = novel(3000);
        let limited = Chunker::new(ChunkerConfig {
            chapter_limit: 2,
            ..Default::default()
        })
        .unwrap()
        .chunk_text(&text);
        assert_eq!(limited.chapters_used, 2);
        assert_eq!(limited.chunks.last().unwrap().char_end, 6000);

        let capped = Chunker::new(ChunkerConfig {
            max_chunks: 2,
            ..Default::default()
        })
        .unwrap()
        .chunk_text(&text);
        assert_eq!(capped.chunks.len(), 2);
        assert_eq!(capped.chunks[1].id, "000001");
    }

    #[test]
    fn volume_selects_one_volume() {
        let first = format!("第一卷 平庸少年\n第1章 离乡\n{}\n", "王".repeat(100));
        let second = format!("第二卷 踏入仙途\n第2章 拜师\n{}\n第3章 修炼\n{}\n", "林".repeat(100), "仙".repeat(100));
        let text = format!("{first}{second}");
        let offset = first.chars().count();

        let out = Chunker::new(ChunkerConfig {
            volume: 2,
            ..Default::default()
        })
        .unwrap()
        .chunk_text(&text);

        assert_eq!(out.volume_title.as_deref(), Some("第二卷 踏入仙途"));
        assert_eq!(out.chapters_detected, 2);
        assert_eq!(out.chunks.len(), 1);
        assert_eq!(out.chunks[0].char_start, offset);
        assert_eq!(out.chunks[0].char_end, text.chars().count());
        assert_eq!(out.chunks[0].text, second);
        assert_eq!(out.chunks[0].chapter_title, "第2章 拜师");
        assert_eq!((out.chunks[0].chapter_start, out.chunks[0].chapter_end), (1, 2));
    }

    #[test]
    fn missing_volume_chunks_whole_text() {
        let text = novel(1000);
        let out = Chunker::new(ChunkerConfig {
            volume: 3,
            ..Default::default()
        })
        .unwrap()
        .chunk_text(&text);
        assert!(out.volume_title.is_none());
        assert_eq!(out.chapters_detected, 3);
        assert_eq!(reconstruct(&out.chunks), text);
    }

    #[test]
    fn empty_text_has_no_chunks() {
        let out = chunker(100, 10, 0).chunk_text("");
        assert!(out.chunks.is_empty());
    }

    #[test]
    fn multibyte_text_is_sliced_on_char_boundaries() {
        let text = "第1章 甲\n".to_string() + &"道".repeat(95);
        let out = chunker(40, 5, 0).chunk_text(&text);
        assert!(out.chunks.iter().all(|c| c.text.chars().count() == c.char_len()));
        assert_eq!(reconstruct(&out.chunks), text);
    }
}
