mod common;

use axum::http::StatusCode;
use chrono::Utc;
use serde_json::{json, Value};

use shuge::clicks::bucket_keys;

use common::{insert_novel, TestApp};

fn ranked_ids(body: &Value) -> Vec<i64> {
    body["data"]["novels"]
        .as_array()
        .unwrap()
        .iter()
        .map(|n| n["id"].as_i64().unwrap())
        .collect()
}

fn listed_ids(body: &Value) -> Vec<i64> {
    body["data"]["items"]
        .as_array()
        .unwrap()
        .iter()
        .map(|n| n["id"].as_i64().unwrap())
        .collect()
}

/// Percent-encode everything but unreserved ASCII.
fn encode(value: &str) -> String {
    value
        .bytes()
        .map(|b| match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                (b as char).to_string()
            }
            _ => format!("%{:02X}", b),
        })
        .collect()
}

#[tokio::test]
async fn rankings_follow_each_period_after_a_flush() {
    let mut app = TestApp::new().await;
    app.user("admin@example.com", "admin");
    for id in 1..=3 {
        insert_novel(&app, id, "approved", "a", 0);
    }
    insert_novel(&app, 4, "pending", "a", 1000);

    // Earlier clicks in the current buckets survive the flush.
    let offset = app.state.clicks.offset();
    let keys = bucket_keys(Utc::now(), offset);
    app.exec(&format!(
        "INSERT INTO click_buckets (kind, bucket) VALUES ('day', '{}'), ('week', '{}'), ('month', '{}');
         UPDATE novels SET week_clicks = 10, month_clicks = 10, click_count = 10 WHERE id = 1;
         UPDATE novels SET month_clicks = 20, click_count = 20 WHERE id = 2;
         UPDATE novels SET click_count = 50 WHERE id = 3;",
        keys.day, keys.week, keys.month
    ));

    // Cached before any click lands; ties fall back to id order.
    let before = app.get("/rankings?type=today", None).await;
    assert_eq!(before.status, StatusCode::OK);
    assert_eq!(ranked_ids(&before.json()), vec![1, 2, 3]);

    app.start_workers();
    for (id, clicks) in [(2, 3), (3, 1)] {
        for _ in 0..clicks {
            let click = app
                .post_json(&format!("/novels/{}/click", id), None, json!({}))
                .await;
            assert_eq!(click.status, StatusCode::OK);
        }
    }
    app.stop_workers().await;

    // today: 1=0 2=3 3=1 / week: 1=10 2=3 3=1 / month: 1=10 2=23 3=1 / total: 1=10 2=23 3=51
    for (kind, expected) in [
        ("today", vec![2, 3, 1]),
        ("week", vec![1, 2, 3]),
        ("month", vec![2, 1, 3]),
        ("total", vec![3, 2, 1]),
    ] {
        let response = app.get(&format!("/rankings?type={}", kind), None).await;
        assert_eq!(response.status, StatusCode::OK, "{}", kind);
        let body = response.json();
        assert_eq!(body["data"]["type"], kind);
        assert_eq!(ranked_ids(&body), expected, "{} ranking", kind);
    }

    let default_kind = app.get("/rankings", None).await.json();
    assert_eq!(default_kind["data"]["type"], "total");
    assert_eq!(ranked_ids(&default_kind), vec![3, 2, 1]);
}

#[tokio::test]
async fn rankings_filter_by_category_and_clamp_the_limit() {
    let app = TestApp::new().await;
    app.user("admin@example.com", "admin");
    for (id, clicks) in [(1, 30), (2, 20), (3, 10)] {
        insert_novel(&app, id, "approved", "a", clicks);
    }
    app.exec(
        "INSERT INTO categories (id, name, parent_id) VALUES (1, '玄幻', NULL), (2, '东方玄幻', 1), (3, '都市', NULL);
         INSERT INTO novel_categories (novel_id, category_id) VALUES (1, 3), (2, 2), (3, 1);",
    );

    let fantasy = app.get("/rankings?type=total&category_id=1", None).await;
    assert_eq!(ranked_ids(&fantasy.json()), vec![2, 3]);

    let top = app.get("/rankings?type=total&limit=1", None).await.json();
    assert_eq!(ranked_ids(&top), vec![1]);
    assert_eq!(top["data"]["limit"], 1);

    let clamped = app.get("/rankings?type=total&limit=1000", None).await.json();
    assert_eq!(clamped["data"]["limit"], 100);
    assert_eq!(ranked_ids(&clamped), vec![1, 2, 3]);

    let unknown = app.get("/rankings?type=yearly", None).await;
    assert_eq!(unknown.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn keyword_search_combines_with_categories_and_scores() {
    let app = TestApp::new().await;
    app.user("admin@example.com", "admin");
    let (_, alice) = app.user("alice@example.com", "alice");
    for id in 1..=4 {
        insert_novel(&app, id, "approved", "someone", 0);
    }
    app.exec(
        "UPDATE novels SET title = '斗破苍穹' WHERE id = 1;
         UPDATE novels SET author = '天蚕土豆' WHERE id = 2;
         UPDATE novels SET protagonist = '萧炎', description = '斗气大陆' WHERE id = 3;
         UPDATE novels SET title = '凡人修仙传' WHERE id = 4;
         INSERT INTO categories (id, name, parent_id) VALUES (1, '玄幻', NULL), (2, '异世大陆', 1);
         INSERT INTO novel_categories (novel_id, category_id) VALUES (1, 2), (3, 1), (4, 2);",
    );

    let all = app.get(&format!("/novels?q={}", encode("斗")), None).await;
    assert_eq!(all.status, StatusCode::OK);
    let mut ids = listed_ids(&all.json());
    ids.sort_unstable();
    assert_eq!(ids, vec![1, 3]);

    let by_author = app.get(&format!("/novels?q={}", encode("土豆")), None).await;
    assert_eq!(listed_ids(&by_author.json()), vec![2]);

    let in_category = app
        .get(&format!("/novels?q={}&category_id=2", encode("斗")), None)
        .await;
    assert_eq!(listed_ids(&in_category.json()), vec![1]);

    app.post_json("/novels/1/ratings", Some(&alice), json!({ "score": 9 }))
        .await;
    app.post_json("/novels/3/ratings", Some(&alice), json!({ "score": 4 }))
        .await;
    let well_rated = app
        .get(&format!("/novels?q={}&min_score=8", encode("斗")), None)
        .await;
    assert_eq!(listed_ids(&well_rated.json()), vec![1]);
    let middling = app.get("/novels?min_score=3&max_score=5", None).await;
    assert_eq!(listed_ids(&middling.json()), vec![3]);

    let inverted = app.get("/novels?min_score=7&max_score=2", None).await;
    assert_eq!(inverted.status, StatusCode::BAD_REQUEST);
    let too_long = app
        .get(&format!("/novels?q={}", "a".repeat(101)), None)
        .await;
    assert_eq!(too_long.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn searches_feed_hot_keywords_and_suggestions() {
    let app = TestApp::new().await;
    app.user("admin@example.com", "admin");
    insert_novel(&app, 1, "approved", "a", 5);
    insert_novel(&app, 2, "approved", "b", 9);
    insert_novel(&app, 3, "pending", "c", 100);
    app.exec(
        "UPDATE novels SET title = '斗破苍穹' WHERE id = 1;
         UPDATE novels SET title = '斗罗大陆' WHERE id = 2;
         UPDATE novels SET title = '斗战狂潮' WHERE id = 3;",
    );

    for (keyword, times) in [("斗罗", 3), ("修仙", 1)] {
        for _ in 0..times {
            let search = app.get(&format!("/novels?q={}", encode(keyword)), None).await;
            assert_eq!(search.status, StatusCode::OK);
        }
    }
    // Later pages do not count as new searches.
    app.get(&format!("/novels?q={}&page=2", encode("修仙")), None)
        .await;

    let hot = app.get("/search/hot-keywords", None).await.json();
    assert_eq!(hot["data"], json!(["斗罗", "修仙"]));

    let suggested = app
        .get(&format!("/search/suggestions?q={}", encode("斗")), None)
        .await
        .json();
    let items = suggested["data"].as_array().unwrap();
    let texts: Vec<&str> = items.iter().map(|s| s["text"].as_str().unwrap()).collect();
    assert_eq!(texts, vec!["斗罗大陆", "斗破苍穹", "斗罗"]);
    assert_eq!(items[0]["source"], "title");
    assert_eq!(items[2]["source"], "search");
    assert_eq!(items[2]["count"], 3);

    let blank = app.get("/search/suggestions?q=%20", None).await.json();
    assert_eq!(blank["data"], json!([]));
}
