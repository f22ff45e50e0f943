use nrl_utils::*;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, PartialEq)]
struct Report {
    zeta: f32,
    alpha: Vec<usize>,
}

#[test]
fn test_jsonify_sorts_keys() {
    let report = Report {
        zeta: 0.5,
        alpha: vec![1, 2],
    };
    assert_eq!(jsonify(&report).unwrap(), r#"{"alpha":[1,2],"zeta":0.5}"#);
}

#[test]
fn test_load_json_inline() {
    let report: Report = load_json(r#"{"zeta": 1.5, "alpha": []}"#).unwrap();
    assert_eq!(
        report,
        Report {
            zeta: 1.5,
            alpha: vec![]
        }
    );
    assert!(load_json::<Report>("{").is_err());
}
