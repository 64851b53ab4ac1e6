//! 分词：知识库关键词检索用
//!
//! 包含 CJK 字符时用 jieba 搜索引擎模式分词，否则按非字母数字字符切分；丢弃常见英文停用词。

use std::collections::HashSet;
use std::sync::OnceLock;

use jieba_rs::Jieba;

static JIEBA: OnceLock<Jieba> = OnceLock::new();

fn get_jieba() -> &'static Jieba {
    JIEBA.get_or_init(Jieba::new)
}

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "can", "do", "does", "for", "how", "in", "is", "it", "me", "my",
    "of", "on", "or", "the", "to", "what", "where", "with", "you", "your",
];

/// 判断字符是否为 CJK（中日韩）字符
fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{4E00}'..='\u{9FFF}' |
        '\u{3400}'..='\u{4DBF}' |
        '\u{F900}'..='\u{FAFF}' |
        '\u{3040}'..='\u{309F}' |
        '\u{30A0}'..='\u{30FF}'
    )
}

pub fn contains_cjk(text: &str) -> bool {
    text.chars().any(is_cjk)
}

pub fn tokenize(text: &str) -> Vec<String> {
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }

    let raw: Vec<String> = if contains_cjk(text) {
        get_jieba()
            .cut_for_search(text, true)
            .into_iter()
            .map(|s| s.trim().to_lowercase())
            .collect()
    } else {
        text.split(|c: char| !c.is_alphanumeric())
            .map(|s| s.to_lowercase())
            .collect()
    };

    raw.into_iter()
        .filter(|s| {
            let first = s.chars().next().unwrap_or(' ');
            (s.chars().count() > 1 || is_cjk(first)) && first.is_alphanumeric()
        })
        .filter(|s| !STOPWORDS.contains(&s.as_str()))
        .collect()
}

pub fn tokenize_to_set(text: &str) -> HashSet<String> {
    tokenize(text).into_iter().collect()
}

/// Jaccard 相似度
pub fn jaccard_similarity(set1: &HashSet<String>, set2: &HashSet<String>) -> f32 {
    if set1.is_empty() || set2.is_empty() {
        return 0.0;
    }
    let intersection = set1.intersection(set2).count() as f32;
    let union = set1.union(set2).count() as f32;
    intersection / union
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_english_strips_punctuation_and_stopwords() {
        let tokens = tokenize("How do I reset my password?");
        assert_eq!(tokens, vec!["reset".to_string(), "password".to_string()]);
    }

    #[test]
    fn test_tokenize_chinese() {
        let tokens = tokenize("如何重置密码");
        assert!(tokens.iter().any(|t| t.contains("密码")));
    }

    #[test]
    fn test_jaccard_similarity() {
        let a = tokenize_to_set("reset password link");
        let b = tokenize_to_set("password reset email");
        assert!(jaccard_similarity(&a, &b) > 0.3);
        assert_eq!(jaccard_similarity(&a, &HashSet::new()), 0.0);
    }
}
