//! Chapter heading detection.

use std::sync::LazyLock;

use regex::Regex;

/// Title used when the text has no recognizable chapter headings.
pub const WHOLE_TEXT_TITLE: &str = "全文";

/// Headings longer than this are body text that happens to cite a chapter.
const MAX_HEADING_CHARS: usize = 60;

/// Sentence-final characters; a line ending in one is prose, not a heading.
const SENTENCE_END: &[char] = &['。', '！', '？', '”', '」', '!', '?'];

/// Characters that continue `第N回` as ordinary prose (`第二回合`, `第三回了。`).
const HUI_CONTINUATION: &[char] = &[
    '合', '了', '。', '，', '、', '！', '？', '；', '：', '…', '”', '」', ',', '.', '!', '?',
];

/// A line starting with `第<n>章` or `第<n>回`, optionally after a volume
/// prefix on the same line such as `第一卷 平庸少年 第001章 离乡`.
static CHAPTER_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?m)^[^\S\n]*(?P<title>(?:第[^\S\n]*[0-9０-９一二三四五六七八九十百千零〇两]{1,9}[^\S\n]*卷[^\n]*?)?第[^\S\n]*[0-9０-９一二三四五六七八九十百千零〇两]{1,9}[^\S\n]*(?P<kind>[章回])(?P<rest>[^\n]*?))[^\S\n]*$",
    )
    .expect("chapter regex compiles")
});

/// A line starting with `第<n>卷`.
static VOLUME_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?m)^[^\S\n]*(?P<title>第[^\S\n]*[0-9０-９一二三四五六七八九十百千零〇两]{1,9}[^\S\n]*卷[^\n]*?)[^\S\n]*$",
    )
    .expect("volume regex compiles")
});

fn looks_like_prose(title: &str) -> bool {
    title.chars().count() > MAX_HEADING_CHARS || title.ends_with(SENTENCE_END)
}

/// Character offset of every heading matched by `re`, with its title.
fn heading_starts(
    text: &str,
    re: &Regex,
    accept: impl Fn(&regex::Captures<'_>) -> bool,
) -> Vec<(usize, String)> {
    let mut starts = Vec::new();
    let mut last_byte = 0;
    let mut last_char = 0;

    for caps in re.captures_iter(text) {
        let (Some(whole), Some(title)) = (caps.get(0), caps.name("title")) else {
            continue;
        };
        let title = title.as_str().trim();
        if looks_like_prose(title) || !accept(&caps) {
            continue;
        }
        let byte = whole.start();
        last_char += text[last_byte..byte].chars().count();
        last_byte = byte;
        starts.push((last_char, title.to_string()));
    }
    starts
}

/// One chapter of the source text, in character offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapterSpan {
    /// 1-based chapter number in reading order.
    pub index: usize,
    pub title: String,
    pub char_start: usize,
    pub char_end: usize,
}

/// Split `text` into chapters that together cover every character.
///
/// Text before the first heading is folded into the first chapter.
pub fn find_chapters(text: &str) -> Vec<ChapterSpan> {
    let total_chars = text.chars().count();

    let starts = heading_starts(text, &CHAPTER_LINE_RE, |caps| {
        let is_hui = caps.name("kind").is_some_and(|k| k.as_str() == "回");
        let continues = caps
            .name("rest")
            .and_then(|r| r.as_str().chars().next())
            .is_some_and(|c| HUI_CONTINUATION.contains(&c));
        !(is_hui && continues)
    });

    if starts.is_empty() {
        return vec![ChapterSpan {
            index: 1,
            title: WHOLE_TEXT_TITLE.to_string(),
            char_start: 0,
            char_end: total_chars,
        }];
    }

    starts
        .iter()
        .enumerate()
        .map(|(i, (start, title))| ChapterSpan {
            index: i + 1,
            title: title.clone(),
            char_start: if i == 0 { 0 } else { *start },
            char_end: starts.get(i + 1).map(|(s, _)| *s).unwrap_or(total_chars),
        })
        .collect()
}

/// One `第N卷` volume, from its heading line to the next volume heading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeSpan {
    /// 1-based volume number in reading order.
    pub index: usize,
    pub title: String,
    pub char_start: usize,
    pub char_end: usize,
}

/// Volumes of `text`. Text before the first volume heading belongs to none.
pub fn find_volumes(text: &str) -> Vec<VolumeSpan> {
    let total_chars = text.chars().count();
    let starts = heading_starts(text, &VOLUME_LINE_RE, |_| true);

    starts
        .iter()
        .enumerate()
        .map(|(i, (start, title))| VolumeSpan {
            index: i + 1,
            title: title.clone(),
            char_start: *start,
            char_end: starts.get(i + 1).map(|(s, _)| *s).unwrap_or(total_chars),
        })
        .collect()
}
