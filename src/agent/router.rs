//! Utterance routing
//!
//! Keyword heuristic deciding whether a question enters the plan loop or is
//! answered by a direct LLM call. The heuristic is an optimisation, not a
//! correctness constraint: a misrouted question still gets an answer.

use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    General,
    DataAnalysis,
}

const DATA_KEYWORDS: &[&str] = &[
    // Korean
    "통계", "데이터", "분석", "조회", "검색", "인구", "경제", "물가", "고용",
    "통계청", "자료", "수치", "얼마", "몇", "비교", "추이", "변화",
    // English
    "statistics", "data", "query", "gdp", "kosis", "population", "average",
    "count", "sum", "total", "how many", "how much", "trend", "compare",
    "rate", "growth",
];

const DATETIME_PATTERNS: &[&str] =
    &["몇시", "시간", "날짜", "오늘", "내일", "어제", "지금", "what time", "what day", "today's date"];

/// Classify one utterance. Time/date questions short-circuit to general;
/// anything carrying a data keyword enters the plan loop (on ambiguous
/// questions data analysis gives the richer answer), everything else is
/// answered directly.
pub fn classify(utterance: &str) -> Route {
    let lower = utterance.to_lowercase();

    if DATETIME_PATTERNS.iter().any(|p| lower.contains(p)) {
        debug!("Routing as general (datetime)");
        return Route::General;
    }

    if DATA_KEYWORDS.iter().any(|k| lower.contains(k)) {
        Route::DataAnalysis
    } else {
        Route::General
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_questions_enter_the_plan_loop() {
        assert_eq!(classify("GDP growth rate 2020-2023"), Route::DataAnalysis);
        assert_eq!(classify("최근 5년 인구 추이 보여줘"), Route::DataAnalysis);
        assert_eq!(classify("how many users do we have?"), Route::DataAnalysis);
    }

    #[test]
    fn test_chitchat_is_general() {
        assert_eq!(classify("안녕하세요!"), Route::General);
        assert_eq!(classify("who are you?"), Route::General);
    }

    #[test]
    fn test_datetime_short_circuits() {
        assert_eq!(classify("지금 몇시야?"), Route::General);
        assert_eq!(classify("what time is it?"), Route::General);
    }
}
