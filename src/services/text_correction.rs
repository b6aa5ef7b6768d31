//! 识别文本纠错规则
//!
//! 规则按固定顺序各执行一次，不做反复迭代直到收敛。
//! 顺序经过安排，使整体结果幂等：`correct_text(correct_text(x)) == correct_text(x)`。
//!
//! 1. 合并连续空白
//! 2. 合并被拆开的 `Cur ent`
//! 3. 清理常见噪声：`Od&` → `00:00`、`O@` → `00`、`~Pre` 删除、标签后的 `;` 改为 `:`、其余 `;` 改为空格
//! 4. 数字串中的易混字符：`O`/`o` → `0`，`l`/`I`/`|` → `1`
//! 5. 修正整词拼写（`Qutbound` → `Outbound`、`Curent` → `Current` 等）；
//!    放在数字修正之后，`5OCurent` 这类粘连的单词在同一遍中就能被识别
//! 6. 数字之间的小数点 / 逗号去空格，逗号统一为小数点
//! 7. 标签与数值分隔：`Current12` → `Current: 12`
//! 8. 再次合并空白

use std::sync::LazyLock;

use phf::phf_map;
use regex::Regex;

/// 整词拼写修正表，键为小写
static WORD_FIXES: phf::Map<&'static str, &'static str> = phf_map! {
    "qutbound" => "Outbound",
    "qoutbound" => "Outbound",
    "cutbound" => "Outbound",
    "lnbound" => "Inbound",
    "curent" => "Current",
    "curant" => "Current",
    "currant" => "Current",
    "marimum" => "Maximum",
    "maxinum" => "Maximum",
    "maxmum" => "Maximum",
    "maximun" => "Maximum",
    "averge" => "Average",
    "avarage" => "Average",
    "fron" => "From",
    "neek" => "Week",
};

static WORD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[A-Za-z]+").expect("valid regex"));
static SPLIT_CURRENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bcur\s+ent\b").expect("valid regex"));
static LABEL_SEMICOLON: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(Current|Average|Maximum)\s*;").expect("valid regex"));
static PRE_SUFFIX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"~Pre\b").expect("valid regex"));
static DIGIT_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[0-9OoIl|][0-9OoIl|.,]*").expect("valid regex"));
static LABEL_VALUE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(Current|Average|Maximum)\s*:?\s*(\d)").expect("valid regex")
});

/// 按固定规则纠正识别文本
pub fn correct_text(raw: &str) -> String {
    let text = collapse_whitespace(raw);
    let text = SPLIT_CURRENT.replace_all(&text, "Current").into_owned();
    let text = fix_artifacts(&text);
    let text = fix_digit_confusions(&text);
    let text = fix_words(&text);
    let text = join_decimal_separators(&text);
    let text = LABEL_VALUE.replace_all(&text, "$1: $2").into_owned();
    collapse_whitespace(&text)
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn fix_words(text: &str) -> String {
    WORD.replace_all(text, |caps: &regex::Captures| {
        let word = &caps[0];
        match WORD_FIXES.get(word.to_ascii_lowercase().as_str()) {
            Some(fixed) => (*fixed).to_string(),
            None => word.to_string(),
        }
    })
    .into_owned()
}

fn fix_artifacts(text: &str) -> String {
    let text = text.replace("Od&", "00:00").replace("O@", "00");
    let text = PRE_SUFFIX.replace_all(&text, "");
    let text = LABEL_SEMICOLON.replace_all(&text, "$1:");
    text.replace(';', " ")
}

/// 数字串中的字母替换
///
/// 只处理含有真实数字的串；串首是字母时还要求它不紧跟在字母之后，
/// 这样单词内部的 `o`、`l` 不会被误改。
fn fix_digit_confusions(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for m in DIGIT_RUN.find_iter(text) {
        let run = m.as_str();
        let starts_with_digit = run.starts_with(|c: char| c.is_ascii_digit());
        let after_letter = text[..m.start()]
            .chars()
            .next_back()
            .is_some_and(|c| c.is_alphabetic());
        let eligible = run.chars().any(|c| c.is_ascii_digit()) && (starts_with_digit || !after_letter);

        out.push_str(&text[last..m.start()]);
        if eligible {
            out.extend(run.chars().map(|c| match c {
                'O' | 'o' => '0',
                'I' | 'l' | '|' => '1',
                other => other,
            }));
        } else {
            out.push_str(run);
        }
        last = m.end();
    }
    out.push_str(&text[last..]);
    out
}

/// `12 , 5` / `12 .5` → `12.5`
fn join_decimal_separators(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out: Vec<char> = Vec::with_capacity(chars.len());
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == '.' || c == ',' {
            let prev_digit = out
                .iter()
                .rev()
                .find(|ch| !ch.is_whitespace())
                .is_some_and(|ch| ch.is_ascii_digit());
            let mut j = i + 1;
            while j < chars.len() && chars[j].is_whitespace() {
                j += 1;
            }
            let next_digit = j < chars.len() && chars[j].is_ascii_digit();
            if prev_digit && next_digit {
                while out.last().is_some_and(|ch| ch.is_whitespace()) {
                    out.pop();
                }
                out.push('.');
                i = j;
                continue;
            }
        }
        out.push(c);
        i += 1;
    }
    out.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLES: &[&str] = &[
        "1O0 Kbps",
        "Inbound Curent:1O0 Kbps Average ; 5O,5 Mbps Marimum 2 . 5 M",
        "Qutbound Cur ent O5 k",
        "Fron 2025-03-01 Od& To 2025-03-31 O@:00 Inbound",
        "isp-cust-pre ACME~Pre / 1562-3523053600",
        "Current1O Average  lOO  Maximum;12 , 75",
        "CurrentO5 total0 Io5 | 7",
        "Average: 5OCurent: 3",
        "Maximum 1lMarimum 2O",
        "",
        "   ",
        "; ; ;",
    ];

    #[test]
    fn test_correct_text_fixes_digit_confusions() {
        assert_eq!(correct_text("1O0 Kbps"), "100 Kbps");
        assert_eq!(correct_text("Current:1O0 Kbps"), "Current: 100 Kbps");
        assert_eq!(correct_text("Current O5"), "Current: 05");
    }

    #[test]
    fn test_correct_text_fixes_words_and_artifacts() {
        assert_eq!(
            correct_text("Qutbound Cur ent: 3 , 5 Mbps Marimum ; 7"),
            "Outbound Current: 3.5 Mbps Maximum: 7"
        );
        assert_eq!(correct_text("Fron 2025 Od&"), "From 2025 00:00");
    }

    #[test]
    fn test_correct_text_leaves_words_alone() {
        assert_eq!(correct_text("Inbound Outbound Total"), "Inbound Outbound Total");
    }

    #[test]
    fn test_correct_text_is_idempotent() {
        for sample in SAMPLES {
            let once = correct_text(sample);
            let twice = correct_text(&once);
            assert_eq!(once, twice, "样本 {:?} 不幂等", sample);
        }
    }

    #[test]
    fn test_word_glued_to_digit_run_is_fixed_in_one_pass() {
        assert_eq!(correct_text("Average: 5OCurent: 3"), "Average: 50Current: 3");
    }

    #[test]
    fn test_correct_text_is_deterministic() {
        for sample in SAMPLES {
            assert_eq!(correct_text(sample), correct_text(sample));
        }
    }
}
