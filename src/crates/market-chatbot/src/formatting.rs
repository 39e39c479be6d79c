//! User-facing response text
//!
//! Formatters are pure: identical items always render identical text.

use flowgraph_core::Formatter;
use serde_json::Value;

const MAX_ITEMS: usize = 5;
const PENDING: &str = "정보 준비 중";

/// Recommendation list for shoppers
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsumerFormatter;

impl Formatter for ConsumerFormatter {
    fn format(&self, items: &[Value]) -> String {
        if items.is_empty() {
            return "아직 추천할 팝업을 찾지 못했어요. 조금 더 원하는 분위기를 알려주시면 다시 찾아볼게요.".to_string();
        }

        let highlights: Vec<String> = items
            .iter()
            .take(MAX_ITEMS)
            .enumerate()
            .map(|(idx, item)| {
                let rating = match item.get("rating").and_then(Value::as_f64) {
                    Some(rating) => format!("★{rating:.1}"),
                    None => "평점 정보 없음".to_string(),
                };
                let mut highlight = format!(
                    "{}. {} · {} ({})\n   · 위치: {}\n   · 분위기 키워드: {}\n   · 편의시설: {}",
                    idx + 1,
                    text(item, "name", "추천 마켓"),
                    text(item, "category", "플리마켓"),
                    rating,
                    text(item, "location", "광주 전역"),
                    join(item, "attributes"),
                    join(item, "amenities"),
                );
                let description = text(item, "description", "");
                if !description.is_empty() {
                    highlight.push_str(&format!("\n   · 한 줄 소개: {description}"));
                }
                highlight
            })
            .collect();

        let mut lines = vec!["눈에 띄는 팝업들을 모아봤어요. 분위기를 바꾸고 싶으면 언제든 말씀 주세요!".to_string(), String::new()];
        lines.extend(highlights);
        lines.push(String::new());
        lines.push("더 궁금한 지역이나 날짜가 있다면 이어서 도와드릴게요.".to_string());
        lines.join("\n")
    }
}

/// Zone and cell guidance for sellers
#[derive(Debug, Clone, Copy, Default)]
pub struct SellerFormatter;

impl Formatter for SellerFormatter {
    fn format(&self, items: &[Value]) -> String {
        if items.is_empty() {
            return "조건에 맞는 입점 구역을 찾지 못했어요. 희망 지역이나 판매 품목을 알려주시면 다시 찾아볼게요.".to_string();
        }

        let mut lines = vec!["입점 가능한 구역을 정리했어요.".to_string(), String::new()];
        for (idx, item) in items.iter().take(MAX_ITEMS).enumerate() {
            lines.push(format!(
                "{}. {} ({})\n   · 추천 구역: {}\n   · 특징: {}\n   · 안내: {}\n   · 다음 단계: {}",
                idx + 1,
                text(item, "zone", "입점 구역"),
                text(item, "theme", "일반"),
                text(item, "suggested_cell", "미정"),
                join(item, "features"),
                text(item, "cell_notice", "추가 안내 없음"),
                text(item, "next_step", "운영 사무국 문의"),
            ));
        }
        lines.push(String::new());
        lines.push("신청 일정이나 준비물이 궁금하면 이어서 물어봐 주세요.".to_string());
        lines.join("\n")
    }
}

fn text<'a>(item: &'a Value, key: &str, default: &'a str) -> &'a str {
    item.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(default)
}

fn join(item: &Value, key: &str) -> String {
    let values: Vec<&str> = item
        .get(key)
        .and_then(Value::as_array)
        .map(|values| values.iter().filter_map(Value::as_str).filter(|s| !s.is_empty()).collect())
        .unwrap_or_default();
    if values.is_empty() {
        PENDING.to_string()
    } else {
        values.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_consumer_empty() {
        assert!(ConsumerFormatter.format(&[]).starts_with("아직 추천할 팝업을 찾지 못했어요"));
    }

    #[test]
    fn test_consumer_item() {
        let items = [json!({
            "name": "양림 달빛 야시장",
            "category": "야시장",
            "attributes": ["야간", "푸드"],
            "amenities": [],
            "location": "광주광역시 남구",
            "rating": 4.6,
            "description": "밤마다 열리는 시장"
        })];
        let text = ConsumerFormatter.format(&items);
        assert!(text.contains("1. 양림 달빛 야시장 · 야시장 (★4.6)"));
        assert!(text.contains("· 분위기 키워드: 야간, 푸드"));
        assert!(text.contains("· 편의시설: 정보 준비 중"));
        assert!(text.contains("· 한 줄 소개: 밤마다 열리는 시장"));
    }

    #[test]
    fn test_consumer_caps_items_and_is_deterministic() {
        let items: Vec<Value> = (0..7).map(|i| json!({"name": format!("마켓 {i}")})).collect();
        let text = ConsumerFormatter.format(&items);
        assert!(text.contains("5. 마켓 4"));
        assert!(!text.contains("6. "));
        assert!(text.contains("평점 정보 없음"));
        assert_eq!(text, ConsumerFormatter.format(&items));
    }

    #[test]
    fn test_seller_item() {
        let items = [json!({
            "zone": "충장로 보행자 거리",
            "theme": "패션 잡화",
            "features": ["주말 운영"],
            "suggested_cell": "A-07",
            "cell_notice": "전기 사용 가능",
            "next_step": "온라인 신청서 작성 후 서류 업로드"
        })];
        let text = SellerFormatter.format(&items);
        assert!(text.contains("1. 충장로 보행자 거리 (패션 잡화)"));
        assert!(text.contains("· 추천 구역: A-07"));
        assert!(SellerFormatter.format(&[]).contains("입점 구역을 찾지 못했어요"));
    }
}
