//! Built-in extraction prompt and per-chunk rendering.

use std::path::Path;

use novelkb_llm::{CompletionRequest, PromptTemplate};
use novelkb_shared::{Chunk, Result};

/// Placeholders an extraction template may use.
pub const PLACEHOLDERS: &[&str] = &[
    "chunk_id",
    "chapter_title",
    "chapter_range",
    "part_index",
    "chunk_text",
];

pub const SYSTEM_PROMPT: &str =
    "You extract structured knowledge from Chinese novel text. Output JSON only.";

pub const DEFAULT_PROMPT: &str = r#"你是中文长篇小说的信息抽取助手。
请从下面的小说片段中抽取人物实体与人物关系，用于生成学习笔记和人物关系图。

只输出一个JSON对象，不要Markdown代码块，也不要任何解释。格式如下：
{
  "entities": [
    {"name": "人物名", "aliases": ["别名或称呼"], "type": "person", "notes": "身份/特征/所属势力", "confidence": 0.0~1.0}
  ],
  "relations": [
    {"from": "人物A", "to": "人物B",
     "type": "师徒/亲友/敌对/同盟/交易/利用/情感/家族/上下级/其他",
     "status": "稳定/变化中/结束/不确定",
     "evidence": {"quote": "原文证据(不超过80字)", "start_char": 0, "end_char": 0},
     "confidence": 0.0~1.0,
     "notes": "判定理由(不超过40字)"}
  ],
  "events": [
    {"summary": "引起关系变化的事件(不超过50字)", "involved": ["人物A", "人物B"], "confidence": 0.0~1.0}
  ]
}

规则：
1) 只抽取片段中明确出现或强烈暗示的人物和关系，不要臆测。
2) 同一人物的别名、称呼写入 aliases。
3) evidence 的 start_char/end_char 是相对本片段的字符位置，从0开始。
"#;

/// Extraction prompt: a template plus the system message.
#[derive(Debug, Clone)]
pub struct ExtractPrompt {
    template: PromptTemplate,
}

impl ExtractPrompt {
    /// The built-in prompt.
    pub fn builtin() -> Result<Self> {
        Ok(Self {
            template: PromptTemplate::parse(DEFAULT_PROMPT, PLACEHOLDERS)?,
        })
    }

    /// Load `path`, or use the built-in prompt when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Ok(Self {
                template: PromptTemplate::from_file(path, PLACEHOLDERS)?,
            }),
            None => Self::builtin(),
        }
    }

    pub fn from_source(source: &str) -> Result<Self> {
        Ok(Self {
            template: PromptTemplate::parse(source, PLACEHOLDERS)?,
        })
    }

    /// Build the request for `chunk`. A template that never places the chunk
    /// text gets a META/TEXT section appended.
    pub fn request_for(&self, chunk: &Chunk) -> CompletionRequest {
        let range = chunk.chapter_range();
        let part = chunk.part_index.to_string();
        let vars = [
            ("chunk_id", chunk.id.as_str()),
            ("chapter_title", chunk.chapter_title.as_str()),
            ("chapter_range", range.as_str()),
            ("part_index", part.as_str()),
            ("chunk_text", chunk.text.as_str()),
        ];

        let mut user = self.template.render(&vars).trim_end().to_string();
        if !self.template.uses("chunk_text") {
            user.push_str("\n\n=== META ===\n");
            user.push_str(&format!("chunk_id: {}\n", chunk.id));
            user.push_str(&format!("chapter: {}\n", chunk.chapter_title));
            user.push_str(&format!("chapters: {range}\n"));
            user.push_str(&format!("part: {part}\n"));
            user.push_str("=== TEXT ===\n");
            user.push_str(&chunk.text);
        }

        CompletionRequest {
            system: SYSTEM_PROMPT.to_string(),
            user,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk() -> Chunk {
        Chunk {
            id: "000002".into(),
            chapter_start: 1,
            chapter_end: 2,
            chapter_title: "第1章 离乡".into(),
            part_index: 3,
            char_start: 0,
            char_end: 6,
            text: "王林拜师学艺".into(),
        }
    }

    #[test]
    fn builtin_prompt_appends_meta_and_text() {
        let req = ExtractPrompt::builtin().unwrap().request_for(&chunk());
        assert_eq!(req.system, SYSTEM_PROMPT);
        assert!(req.user.starts_with("你是中文长篇小说"));
        assert!(req.user.contains("chunk_id: 000002"));
        assert!(req.user.contains("chapters: 1-2"));
        assert!(req.user.ends_with("=== TEXT ===\n王林拜师学艺"));
    }

    #[test]
    fn custom_prompt_places_text_itself() {
        let prompt =
            ExtractPrompt::from_source("[{{chunk_id}} / {{part_index}}] {{chunk_text}}").unwrap();
        let req = prompt.request_for(&chunk());
        assert_eq!(req.user, "[000002 / 3] 王林拜师学艺");
    }
}
