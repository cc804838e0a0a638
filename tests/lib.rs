use liquid_frame::api::{inspect, ApiVersion, InspectRequest, Inspection};
use liquid_frame::error::LiquidError;
use liquid_frame::frame::{Column, ColumnData, Frame, Layout};
use liquid_frame::hex::{CompareOptions, Comparison};
use liquid_frame::kv::Key;
use liquid_frame::mr::{Job, JobStatus};
use liquid_frame::{Cloud, CloudConfig};

fn cloud(num_nodes: usize, chunk_rows: u64) -> Cloud {
    Cloud::new(
        CloudConfig::default()
            .with_nodes(num_nodes)
            .with_threads(2)
            .with_chunk_rows(chunk_rows)
            .with_cache_size(1 << 20),
    )
    .unwrap()
}

fn abc(values: &[Option<&str>]) -> ColumnData {
    ColumnData::with_domain(&["A", "B", "C"], values).unwrap()
}

async fn numeric(cloud: &Cloud, name: &str, values: &[Option<f64>]) -> Column {
    cloud
        .new_column(name, ColumnData::Numeric(values.to_vec()))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_confusion_matrix_of_three_rows() {
    let cloud = cloud(2, 2);
    let actual = cloud
        .new_column("actual", abc(&[Some("A"), Some("B"), Some("C")]))
        .await
        .unwrap();
    let predicted = cloud
        .new_column("predicted", abc(&[Some("A"), Some("B"), Some("A")]))
        .await
        .unwrap();

    let cm = Comparison::compute(&cloud, &actual.key, &predicted.key)
        .await
        .unwrap();
    assert!(cm.is_classification());
    assert_eq!(cm.domain().unwrap(), &["A", "B", "C"]);
    assert_eq!(
        cm.matrix().unwrap(),
        &[
            vec![1, 0, 0, 0],
            vec![0, 1, 0, 0],
            vec![1, 0, 0, 0],
            vec![0, 0, 0, 0],
        ]
    );
    assert!((cm.error_rate().unwrap() - 1.0 / 3.0).abs() < 1e-12);

    let table = cm.to_string();
    assert!(table.contains("Act/Pred"));
    assert!(table.contains("1.000 = 1 / 1"));
    assert!(table.contains("0.333 = 1 / 3"));
}

#[tokio::test]
async fn test_mean_squared_error_of_three_rows() {
    let cloud = cloud(3, 1);
    let actual = numeric(&cloud, "actual", &[Some(1.0), Some(2.0), Some(3.0)]).await;
    let predicted = numeric(&cloud, "predicted", &[Some(1.0), Some(2.0), Some(4.0)]).await;

    let mse = Comparison::compute(&cloud, &actual.key, &predicted.key)
        .await
        .unwrap();
    assert_eq!(mse, Comparison::Regression { sum: 1.0, count: 3 });
    assert_eq!(mse.mse(), Some(1.0 / 3.0));
    assert_eq!(mse.to_string(), format!("MSE: {}", 1.0 / 3.0));
}

#[tokio::test]
async fn test_mean_squared_error_skips_missing_rows() {
    let cloud = cloud(2, 2);
    let actual = numeric(&cloud, "actual", &[Some(1.0), Some(2.0), None, Some(4.0)]).await;
    let predicted =
        numeric(&cloud, "predicted", &[Some(1.0), Some(3.0), Some(5.0), Some(4.0)]).await;

    let mse = Comparison::compute(&cloud, &actual.key, &predicted.key)
        .await
        .unwrap();
    assert_eq!(mse, Comparison::Regression { sum: 1.0, count: 3 });
    assert_eq!(mse.mse(), Some(1.0 / 3.0));
}

#[tokio::test]
async fn test_all_na_regression_is_infinite() {
    let cloud = cloud(2, 4);
    let actual = numeric(&cloud, "actual", &[None; 10]).await;
    let predicted = numeric(&cloud, "predicted", &[Some(1.0); 10]).await;
    let mse = Comparison::compute(&cloud, &actual.key, &predicted.key)
        .await
        .unwrap();
    assert_eq!(mse, Comparison::Regression { sum: 0.0, count: 0 });
    assert_eq!(mse.mse(), Some(f64::INFINITY));
}

#[tokio::test]
async fn test_length_mismatch_starts_no_work() {
    let cloud = cloud(2, 10);
    let actual = numeric(&cloud, "actual", &[Some(1.0); 100]).await;
    let predicted = numeric(&cloud, "predicted", &[Some(1.0); 99]).await;
    let keys = cloud.num_keys().await;

    let job = Job::new();
    let result = Comparison::compute_with(
        &cloud,
        &job,
        &actual.key,
        &predicted.key,
        &CompareOptions::default(),
    )
    .await;
    assert!(matches!(
        result,
        Err(LiquidError::LengthMismatch {
            left: 100,
            right: 99
        })
    ));
    assert_eq!(job.status(), JobStatus::Created);
    assert_eq!(cloud.num_keys().await, keys);
}

#[tokio::test]
async fn test_type_and_presence_checks() {
    let cloud = cloud(1, 10);
    let reals = numeric(&cloud, "reals", &[Some(0.5)]).await;
    let classes = cloud.new_column("classes", abc(&[Some("B")])).await.unwrap();
    let text = cloud
        .new_column("text", ColumnData::Text(vec![Some("x".to_string())]))
        .await
        .unwrap();

    let err = Comparison::compute(&cloud, &reals.key, &classes.key).await;
    assert!(matches!(err, Err(LiquidError::TypeMismatch(_))));
    let err = Comparison::compute(&cloud, &text.key, &text.key).await;
    assert!(matches!(err, Err(LiquidError::TypeMismatch(_))));
    let err = Comparison::compute(&cloud, &Key::new("nowhere", 0), &reals.key).await;
    assert!(matches!(err, Err(LiquidError::MissingColumn(_))));
}

/// Creates the same pair of columns under each `(suffix, layout)` and checks
/// every comparison gives the same answer
async fn compare_across_layouts(
    cloud: &Cloud,
    actual: ColumnData,
    predicted: ColumnData,
    layouts: Vec<(&str, Layout)>,
) -> Vec<Comparison> {
    let mut results = Vec::new();
    for (suffix, layout) in layouts {
        let a = cloud
            .new_column_with_layout(&format!("actual-{}", suffix), actual.clone(), layout.clone())
            .await
            .unwrap();
        let p = cloud
            .new_column_with_layout(&format!("predicted-{}", suffix), predicted.clone(), layout)
            .await
            .unwrap();
        results.push(Comparison::compute(cloud, &a.key, &p.key).await.unwrap());
    }
    results
}

fn layouts(rows: u64) -> Vec<(&'static str, Layout)> {
    vec![
        ("single", Layout::uniform(rows, rows, 3)),
        ("uniform", Layout::uniform(rows, 7, 3)),
        (
            "scattered",
            Layout::from_espc(vec![0, 3, 10, 10, 31, rows], 3)
                .unwrap()
                .with_homes(vec![2, 2, 0, 1, 0])
                .unwrap(),
        ),
    ]
}

#[tokio::test]
async fn test_classification_ignores_partitioning() {
    let cloud = cloud(3, 10);
    let levels = [Some("A"), Some("B"), Some("C"), None];
    let actual: Vec<_> = (0..60).map(|i| levels[i % 4]).collect();
    let predicted: Vec<_> = (0..60).map(|i| levels[(i * 7 + i / 5) % 4]).collect();

    let results =
        compare_across_layouts(&cloud, abc(&actual), abc(&predicted), layouts(60)).await;
    let total: u64 = results[0].matrix().unwrap().iter().flatten().sum();
    assert_eq!(total, 60);
    assert_eq!(results[0], results[1]);
    assert_eq!(results[0], results[2]);
}

#[tokio::test]
async fn test_regression_ignores_partitioning() {
    let cloud = cloud(3, 10);
    // small integers keep every partial sum exact
    let actual: Vec<_> = (0..60).map(|i| Some((i % 11) as f64)).collect();
    let predicted: Vec<_> = (0..60)
        .map(|i| if i % 13 == 0 { None } else { Some((i % 7) as f64) })
        .collect();

    let results = compare_across_layouts(
        &cloud,
        ColumnData::Numeric(actual),
        ColumnData::Numeric(predicted),
        layouts(60),
    )
    .await;
    assert!(matches!(results[0], Comparison::Regression { count: 55, .. }));
    assert_eq!(results[0], results[1]);
    assert_eq!(results[0], results[2]);
}

#[tokio::test]
async fn test_different_domains_are_reconciled() {
    let cloud = cloud(2, 2);
    let actual = cloud
        .new_column("actual", abc(&[Some("A"), Some("B"), Some("C"), Some("A")]))
        .await
        .unwrap();
    let predicted = ColumnData::with_domain(
        &["D", "C", "A"],
        &[Some("A"), Some("C"), Some("D"), None],
    )
    .unwrap();
    // a different layout forces an aligned copy as well
    let layout = Layout::from_espc(vec![0, 1, 4], 2).unwrap();
    let predicted = cloud
        .new_column_with_layout("predicted", predicted, layout)
        .await
        .unwrap();
    let keys = cloud.num_keys().await;

    let cm = Comparison::compute(&cloud, &actual.key, &predicted.key)
        .await
        .unwrap();
    assert_eq!(cm.domain().unwrap(), &["A", "B", "C", "D"]);
    let m = cm.matrix().unwrap();
    assert_eq!(m[0][0], 1);
    assert_eq!(m[1][2], 1);
    assert_eq!(m[2][3], 1);
    assert_eq!(m[0][4], 1);
    assert_eq!(m.iter().flatten().sum::<u64>(), 4);

    // the remapped and aligned copies are gone and the inputs untouched
    assert_eq!(cloud.num_keys().await, keys);
    let predicted = cloud.get_column(&predicted.key).await.unwrap().unwrap();
    assert_eq!(predicted.domain().unwrap(), &["D", "C", "A"]);
}

#[tokio::test]
async fn test_cancelled_comparison_leaves_no_temporaries() {
    let cloud = cloud(2, 2);
    let actual = cloud
        .new_column("actual", abc(&[Some("A"), Some("B"), Some("C")]))
        .await
        .unwrap();
    let predicted = ColumnData::with_domain(&["C", "A"], &[Some("A"), None, Some("C")]).unwrap();
    let predicted = cloud.new_column("predicted", predicted).await.unwrap();
    let keys = cloud.num_keys().await;

    let job = Job::new();
    job.cancel();
    let result = Comparison::compute_with(
        &cloud,
        &job,
        &actual.key,
        &predicted.key,
        &CompareOptions::default(),
    )
    .await;
    assert!(matches!(result, Err(LiquidError::Cancelled)));
    assert_eq!(job.status(), JobStatus::Cancelled);
    assert_eq!(cloud.num_keys().await, keys);
}

#[tokio::test]
async fn test_integer_columns_compared_as_categorical() {
    let cloud = cloud(2, 3);
    let actual = numeric(&cloud, "actual", &[Some(1.0), Some(2.0), Some(3.0), Some(2.0)]).await;
    let predicted =
        numeric(&cloud, "predicted", &[Some(1.0), Some(2.0), Some(2.0), Some(2.0)]).await;

    let mse = Comparison::compute(&cloud, &actual.key, &predicted.key)
        .await
        .unwrap();
    assert_eq!(mse, Comparison::Regression { sum: 1.0, count: 4 });

    // rollups are cached under their own keys, so compute them up front
    cloud.rollups(&actual).await.unwrap();
    cloud.rollups(&predicted).await.unwrap();
    let keys = cloud.num_keys().await;
    let options = CompareOptions {
        to_categorical: true,
    };
    let cm = Comparison::compute_with(&cloud, &Job::new(), &actual.key, &predicted.key, &options)
        .await
        .unwrap();
    assert_eq!(cm.domain().unwrap(), &["1", "2", "3"]);
    let m = cm.matrix().unwrap();
    assert_eq!((m[0][0], m[1][1], m[2][1]), (1, 2, 1));
    assert_eq!(cloud.num_keys().await, keys);

    // real values stay a regression
    let reals = numeric(&cloud, "reals", &[Some(0.5), Some(2.0), Some(3.0), Some(2.0)]).await;
    let mse = Comparison::compute_with(&cloud, &Job::new(), &reals.key, &predicted.key, &options)
        .await
        .unwrap();
    assert!(!mse.is_classification());
}

#[tokio::test]
async fn test_infinite_values_stay_a_regression() {
    let cloud = cloud(2, 2);
    let actual = numeric(&cloud, "actual", &[Some(1.0), Some(f64::INFINITY), Some(2.0)]).await;
    let predicted = numeric(&cloud, "predicted", &[Some(1.0), Some(2.0), Some(2.0)]).await;
    let options = CompareOptions {
        to_categorical: true,
    };
    let result =
        Comparison::compute_with(&cloud, &Job::new(), &actual.key, &predicted.key, &options)
            .await
            .unwrap();
    match result {
        Comparison::Regression { sum, count } => {
            assert_eq!(count, 3);
            assert_eq!(sum, f64::INFINITY);
        }
        other => panic!("expected a regression, got {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_rollups_are_idempotent() {
    let values: Vec<_> = (0..500)
        .map(|i| if i % 17 == 0 { None } else { Some((i as f64).sin() * 1000.0) })
        .collect();
    let cloud = cloud(3, 32);
    let column = numeric(&cloud, "waves", &values).await;
    let first = cloud.rollups(&column).await.unwrap();
    let second = cloud.rollups(&column).await.unwrap();
    assert_eq!(first.mean.to_bits(), second.mean.to_bits());
    assert_eq!(first.sigma.to_bits(), second.sigma.to_bits());

    // two concurrent readers of a fresh column race to publish
    let other = numeric(&cloud, "waves-again", &values).await;
    let (a, b) = tokio::join!(cloud.rollups(&other), cloud.rollups(&other));
    let (a, b) = (a.unwrap(), b.unwrap());
    for r in [&a, &b] {
        assert_eq!(r.mean.to_bits(), first.mean.to_bits());
        assert_eq!(r.sigma.to_bits(), first.sigma.to_bits());
        assert_eq!(r.mins, first.mins);
        assert_eq!(r.maxs, first.maxs);
        assert_eq!(r.na_cnt, 30);
    }
    let cached = cloud.rollups(&other).await.unwrap();
    assert_eq!(cached.mean.to_bits(), first.mean.to_bits());
}

#[tokio::test]
async fn test_inspect_and_delete_frame() {
    let cloud = cloud(2, 2);
    let actual = cloud
        .new_column("actual", abc(&[Some("A"), None, Some("C")]))
        .await
        .unwrap();
    let score = numeric(&cloud, "score", &[Some(0.25), Some(0.5), None]).await;
    let mut frame = Frame::new(Key::new("scored", 1));
    frame.add("actual", &actual).unwrap();
    frame.add("score", &score).unwrap();
    cloud.put_frame(&frame).await.unwrap();

    let request = InspectRequest {
        offset: 2,
        len: 5,
        ..InspectRequest::new(ApiVersion::try_from(2).unwrap(), frame.key.clone())
    };
    match inspect(&cloud, &request).await.unwrap() {
        Inspection::V2(v2) => {
            assert_eq!((v2.off, v2.len, v2.rows), (1, 3, 3));
            assert_eq!(v2.columns[0].kind, "enum");
            assert_eq!(v2.columns[0].missing, 1);
            assert_eq!(v2.columns[1].kind, "real");
            let data = v2.columns[1].data.as_ref().unwrap();
            assert_eq!(data[0], 0.5);
            assert!(data[1].is_nan());
        }
        other => panic!("expected a v2 response, got {:?}", other),
    }

    cloud.delete_frame(&frame.key).await.unwrap();
    assert_eq!(cloud.num_keys().await, 0);
    assert!(cloud.get_frame(&frame.key).await.unwrap().is_none());
}
