//! End-to-end runs over in-memory sources with stub capabilities.
//!
//! Every test here is offline and deterministic: CSV bytes are literals,
//! workbooks come from [`common::XlsxFixture`], and model calls are answered
//! by [`common::StubText`] / [`common::StubVision`].

mod common;

use common::{media, StubText, StubVision, XlsxFixture};
use edgequake_tab2rag::pipeline::route::RoutingSource;
use edgequake_tab2rag::pipeline::standardize::RuleOrigin;
use edgequake_tab2rag::{
    DegradationKind, IngestionError, Pipeline, PipelineConfig, PipelineStage, SchemaTag,
    SourceFile, StandardizeError, StandardizedRecord,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

// ── Helpers ──────────────────────────────────────────────────────────────────

const ARTICLES_CSV: &str = "titulo,texto,numero\n\
Montaje,Instrucciones para montar el equipo,1\n\
Limpieza,Pasos de limpieza semanal,2\n\
Garantia,Condiciones de la garantia,3\n";

fn pipeline(config: PipelineConfig, text: StubText, vision: StubVision) -> Pipeline {
    Pipeline::new(config, Arc::new(text), Arc::new(vision))
}

fn pipeline_with(text: Arc<StubText>, vision: Arc<StubVision>) -> Pipeline {
    Pipeline::new(PipelineConfig::default(), text, vision)
}

fn csv(text: &str) -> SourceFile {
    SourceFile::new(text.as_bytes().to_vec(), "articulos.csv").unwrap()
}

fn xlsx(fixture: &XlsxFixture) -> SourceFile {
    SourceFile::new(fixture.build(), "manual.xlsx").unwrap()
}

fn captions(records: &[StandardizedRecord]) -> Vec<Option<String>> {
    records
        .iter()
        .map(|r| r.as_rag1().expect("RAG1 record").image_caption.clone())
        .collect()
}

/// Record values with the freshly generated id blanked out.
fn without_ids(records: &[StandardizedRecord]) -> Vec<StandardizedRecord> {
    records
        .iter()
        .cloned()
        .map(|r| match r {
            StandardizedRecord::Rag1(mut r) => {
                r.id.clear();
                StandardizedRecord::Rag1(r)
            }
            StandardizedRecord::Rag2(mut r) => {
                r.id.clear();
                StandardizedRecord::Rag2(r)
            }
        })
        .collect()
}

fn manual_fixture() -> XlsxFixture {
    XlsxFixture::new(&["titulo", "texto", "numero"])
        .row(&["Montaje", "Instrucciones para montar el equipo", "1"])
        .row(&["Limpieza", "Pasos de limpieza semanal", "2"])
}

// ── Captions ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn csv_records_have_null_captions() {
    let vision = Arc::new(StubVision::new());
    let p = pipeline_with(Arc::new(StubText::agreeable()), vision.clone());

    let result = p.run(&csv(ARTICLES_CSV)).await.unwrap();

    assert_eq!(result.schema, SchemaTag::Rag1);
    assert_eq!(result.records.len(), 3);
    assert!(captions(&result.records).iter().all(Option::is_none));
    assert_eq!(vision.call_count(), 0);
    assert_eq!(result.metadata.image_count, 0);
    assert_eq!(result.metadata.captioned_records, 0);
}

#[tokio::test]
async fn three_images_build_a_step_caption() {
    let fixture = manual_fixture().picture(0, 3).picture(0, 4).picture(0, 5);
    let vision = StubVision::new()
        .describe(&media(1), "A")
        .describe(&media(2), "B.")
        .describe(&media(3), "C");
    let p = pipeline(PipelineConfig::default(), StubText::agreeable(), vision);

    let result = p.run(&xlsx(&fixture)).await.unwrap();

    assert_eq!(
        captions(&result.records),
        vec![
            Some("Paso 1 (Imagen 1): A. Paso 2 (Imagen 2): B. Paso 3 (Imagen 3): C.".to_string()),
            None,
        ]
    );
    assert_eq!(result.metadata.image_count, 3);
    assert_eq!(result.metadata.captioned_records, 1);
    assert!(result
        .degradations_of(DegradationKind::VisionAnalysisFailure)
        .next()
        .is_none());
}

#[tokio::test]
async fn failed_image_is_left_out_and_steps_renumbered() {
    let fixture = manual_fixture().picture(1, 3).picture(1, 4);
    let vision = StubVision::new()
        .describe(&media(1), "A")
        .fail(&media(2));
    let p = pipeline(PipelineConfig::default(), StubText::agreeable(), vision);

    let result = p.run(&xlsx(&fixture)).await.unwrap();

    assert_eq!(
        captions(&result.records),
        vec![None, Some("Paso 1 (Imagen 1): A.".to_string())]
    );
    let failures: Vec<_> = result
        .degradations_of(DegradationKind::VisionAnalysisFailure)
        .collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].row, Some(1));
    assert_eq!(failures[0].image, Some(2));
    assert_eq!(failures[0].stage, PipelineStage::Standardizing);
}

#[tokio::test]
async fn first_image_failing_renumbers_the_rest() {
    let fixture = manual_fixture().picture(0, 3).picture(0, 4).picture(0, 5);
    let vision = StubVision::new()
        .fail(&media(1))
        .describe(&media(2), "B")
        .silent(&media(3));
    let p = pipeline(PipelineConfig::default(), StubText::agreeable(), vision);

    let result = p.run(&xlsx(&fixture)).await.unwrap();

    assert_eq!(
        captions(&result.records)[0].as_deref(),
        Some("Paso 1 (Imagen 1): B.")
    );
}

#[tokio::test]
async fn single_image_caption_is_the_description() {
    let fixture = manual_fixture().picture(0, 3);
    let vision = StubVision::new().describe(&media(1), "Vista frontal del equipo.");
    let p = pipeline(PipelineConfig::default(), StubText::agreeable(), vision);

    let result = p.run(&xlsx(&fixture)).await.unwrap();

    assert_eq!(
        captions(&result.records)[0].as_deref(),
        Some("Vista frontal del equipo.")
    );
}

#[tokio::test]
async fn all_images_failing_gives_null_caption() {
    let fixture = manual_fixture().picture(0, 3).picture(0, 4);
    let vision = StubVision::new().fail(&media(1)).fail(&media(2));
    let p = pipeline(PipelineConfig::default(), StubText::agreeable(), vision);

    let result = p.run(&xlsx(&fixture)).await.unwrap();

    assert_eq!(captions(&result.records), vec![None, None]);
    assert_eq!(
        result
            .degradations_of(DegradationKind::VisionAnalysisFailure)
            .count(),
        2
    );
    assert_eq!(result.records.len(), 2);
}

#[tokio::test]
async fn images_are_ordered_by_column_within_a_row() {
    // Inserted right-to-left; the caption must read left-to-right.
    let fixture = manual_fixture().picture(0, 5).picture(0, 3);
    let vision = StubVision::new()
        .describe(&media(1), "derecha")
        .describe(&media(2), "izquierda");
    let p = pipeline(PipelineConfig::default(), StubText::agreeable(), vision);

    let result = p.run(&xlsx(&fixture)).await.unwrap();

    assert_eq!(
        captions(&result.records)[0].as_deref(),
        Some("Paso 1 (Imagen 1): izquierda. Paso 2 (Imagen 2): derecha.")
    );
}

#[tokio::test]
async fn describe_images_off_skips_vision() {
    let fixture = manual_fixture().picture(0, 3);
    let vision = Arc::new(StubVision::new().describe(&media(1), "A"));
    let config = PipelineConfig::builder()
        .describe_images(false)
        .build()
        .unwrap();
    let p = Pipeline::new(config, Arc::new(StubText::agreeable()), vision.clone());

    let result = p.run(&xlsx(&fixture)).await.unwrap();

    assert_eq!(captions(&result.records), vec![None, None]);
    assert_eq!(vision.call_count(), 0);
    assert!(!result.is_degraded());
}

// ── Image extraction ─────────────────────────────────────────────────────────

#[tokio::test]
async fn bad_pictures_are_dropped_one_by_one() {
    let fixture = manual_fixture()
        .picture(0, 3)
        .picture_bytes(0, 4, b"\x89PNG\r\n\x1a\n\0\0 truncated")
        .picture_bytes(1, 3, b"plain text, not an image")
        .header_picture(5)
        .absolute_picture()
        .unlinked_picture(1, 4)
        .picture(1, 5);
    let vision = Arc::new(
        StubVision::new()
            .describe(&media(1), "Vista frontal")
            .describe(&media(7), "Vista lateral"),
    );
    let p = pipeline_with(Arc::new(StubText::agreeable()), vision.clone());

    let result = p.run(&xlsx(&fixture)).await.unwrap();

    assert_eq!(
        captions(&result.records),
        vec![
            Some("Vista frontal".to_string()),
            Some("Vista lateral".to_string())
        ]
    );
    assert_eq!(result.metadata.image_count, 2);
    assert_eq!(vision.call_count(), 2);

    let warnings: Vec<_> = result
        .degradations_of(DegradationKind::ImageExtractionWarning)
        .collect();
    assert_eq!(
        warnings.iter().map(|w| w.image).collect::<Vec<_>>(),
        vec![Some(2), Some(3), Some(4), Some(5), Some(6)]
    );
    assert_eq!(
        warnings.iter().map(|w| w.row).collect::<Vec<_>>(),
        vec![Some(0), Some(1), None, None, Some(1)]
    );
    assert!(warnings.iter().all(|w| w.stage == PipelineStage::Ingesting));
    assert!(warnings[0].detail.contains("corrupt"), "got: {}", warnings[0].detail);
    assert!(warnings[1].detail.contains("unrecognized"), "got: {}", warnings[1].detail);
    assert!(warnings[2].detail.contains("header row"), "got: {}", warnings[2].detail);
    assert!(warnings[3].detail.contains("absolute"), "got: {}", warnings[3].detail);
    assert!(warnings[4].detail.contains("not found"), "got: {}", warnings[4].detail);
}

#[tokio::test]
async fn oversized_media_part_is_dropped() {
    let fixture = manual_fixture()
        .picture_bytes(0, 3, &vec![0u8; 200_000])
        .picture(1, 3);
    let vision = StubVision::new().describe(&media(2), "Vista lateral");
    let config = PipelineConfig {
        max_file_bytes: 50_000,
        ..PipelineConfig::default()
    };
    let source = xlsx(&fixture);
    assert!(source.size() < 50_000);
    let p = pipeline(config, StubText::agreeable(), vision);

    let result = p.run(&source).await.unwrap();

    assert_eq!(
        captions(&result.records),
        vec![None, Some("Vista lateral".to_string())]
    );
    let warnings: Vec<_> = result
        .degradations_of(DegradationKind::ImageExtractionWarning)
        .collect();
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].detail.contains("inflates past"), "got: {}", warnings[0].detail);
}

#[tokio::test]
async fn out_of_range_image_dimension_still_runs() {
    let fixture = manual_fixture().picture(0, 3);
    let vision = StubVision::new().describe(&media(1), "Vista frontal");
    let config = PipelineConfig {
        max_image_dimension: 0,
        ..PipelineConfig::default()
    };
    let p = pipeline(config, StubText::agreeable(), vision);

    let result = p.run(&xlsx(&fixture)).await.unwrap();

    assert_eq!(captions(&result.records)[0].as_deref(), Some("Vista frontal"));
}

// ── Scheduling ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn vision_calls_never_overlap() {
    let fixture = manual_fixture()
        .picture(0, 3)
        .picture(0, 4)
        .picture(1, 3)
        .picture(1, 4);
    let vision = Arc::new(
        StubVision::new()
            .describe(&media(1), "A")
            .describe(&media(2), "B")
            .describe(&media(3), "C")
            .describe(&media(4), "D")
            .with_delay(Duration::from_millis(15)),
    );
    let p = pipeline_with(Arc::new(StubText::agreeable()), vision.clone());

    let result = p.run(&xlsx(&fixture)).await.unwrap();

    assert_eq!(vision.peak_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(
        *vision.calls.lock().unwrap(),
        vec![media(1), media(2), media(3), media(4)]
    );
    assert_eq!(result.metadata.captioned_records, 2);
}

// ── Failure and fallback ─────────────────────────────────────────────────────

#[tokio::test]
async fn undecodable_bytes_fail_in_ingestion() {
    let p = pipeline(
        PipelineConfig::default(),
        StubText::agreeable(),
        StubVision::new(),
    );
    let source = SourceFile::new(b"titulo,texto\n\x00\x01\x02\x03".to_vec(), "roto.csv").unwrap();

    let failure = p.run(&source).await.unwrap_err();

    assert!(failure.is_ingestion_failure());
    assert_eq!(failure.failed_in, PipelineStage::Ingesting);
    assert!(matches!(
        failure.error,
        StandardizeError::IngestionFailure(IngestionError::UndecodableText { .. })
    ));
}

#[tokio::test]
async fn corrupt_workbook_fails_in_ingestion() {
    let p = pipeline(
        PipelineConfig::default(),
        StubText::agreeable(),
        StubVision::new(),
    );
    let source = SourceFile::new(b"PK\x03\x04 not really a zip".to_vec(), "roto.xlsx").unwrap();

    let failure = p.run(&source).await.unwrap_err();

    assert!(failure.is_ingestion_failure());
    assert!(failure.to_string().contains("ingest"), "got: {failure}");
}

#[tokio::test]
async fn failing_text_capability_falls_back_to_heuristics() {
    let text = Arc::new(StubText::failing());
    let p = pipeline_with(text.clone(), Arc::new(StubVision::new()));

    let result = p.run(&csv(ARTICLES_CSV)).await.unwrap();

    let routing = &result.metadata.routing;
    assert_eq!(routing.schema, SchemaTag::Rag1);
    assert_eq!(routing.source, RoutingSource::Heuristic);
    assert!(routing.confidence <= 0.5, "got {}", routing.confidence);
    assert_eq!(result.metadata.rule_origin, RuleOrigin::DirectMapping);
    assert_eq!(
        result
            .degradations_of(DegradationKind::RoutingUncertainty)
            .count(),
        1
    );

    // Records are still produced, straight from the columns.
    assert_eq!(result.records.len(), 3);
    let first = result.records[0].as_rag1().unwrap();
    assert_eq!(first.titulo, "Montaje");
    assert_eq!(first.texto, "Instrucciones para montar el equipo");
    assert_eq!(first.numero, 1);
    assert_eq!(text.analyze_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn record_count_matches_row_count() {
    let tickets = "descripcion,servicio,categoria\n\
No enciende la impresora,Soporte,Hardware\n\
,,\n\
Sin acceso al correo,Correo,Cuentas\n\
Pantalla azul al iniciar,,Sistema\n";
    let p = pipeline(
        PipelineConfig::default(),
        StubText::failing(),
        StubVision::new(),
    );

    let result = p.run(&csv(tickets)).await.unwrap();

    // The blank line is skipped by ingestion; every remaining row survives.
    assert_eq!(result.metadata.row_count, 3);
    assert_eq!(result.records.len(), 3);
    assert_eq!(result.validation.total_records, 3);
    assert_eq!(result.schema, SchemaTag::Rag2);
    assert!(result.records.iter().all(|r| r.as_rag2().is_some()));
}

#[tokio::test]
async fn panicking_vision_client_fails_the_run() {
    let fixture = manual_fixture().picture(0, 3);
    let vision = StubVision::new().panic(&media(1));
    let p = pipeline(PipelineConfig::default(), StubText::agreeable(), vision);

    let failure = p.run(&xlsx(&fixture)).await.unwrap_err();

    assert_eq!(failure.failed_in, PipelineStage::Standardizing);
    assert!(!failure.is_ingestion_failure());
    match &failure.error {
        StandardizeError::Internal(detail) => {
            assert!(detail.contains("vision client crashed"), "got: {detail}")
        }
        other => panic!("expected an internal error, got {other:?}"),
    }
    assert_eq!(
        failure.stages.iter().map(|s| s.stage).collect::<Vec<_>>(),
        vec![
            PipelineStage::Ingesting,
            PipelineStage::Routing,
            PipelineStage::Standardizing,
        ]
    );
}

// ── Routing ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn capability_verdict_wins_over_heuristics() {
    let text = StubText::agreeable()
        .with_routing(r#"{"schema": "RAG2", "rationale": "service catalogue", "confidence": 0.7}"#);
    let p = pipeline(PipelineConfig::default(), text, StubVision::new());

    let result = p.run(&csv(ARTICLES_CSV)).await.unwrap();

    assert_eq!(result.schema, SchemaTag::Rag2);
    assert_eq!(result.metadata.routing.source, RoutingSource::Capability);
    assert_eq!(result.metadata.routing.heuristic.candidate, SchemaTag::Rag1);
    assert!((result.metadata.routing.confidence - 0.7).abs() < 1e-9);
    assert_eq!(result.records.len(), 3);
}

#[tokio::test]
async fn forced_schema_skips_the_routing_call() {
    let text = Arc::new(StubText::agreeable());
    let config = PipelineConfig::builder()
        .forced_schema(SchemaTag::Rag2)
        .build()
        .unwrap();
    let p = Pipeline::new(config, text.clone(), Arc::new(StubVision::new()));

    let result = p.run(&csv(ARTICLES_CSV)).await.unwrap();

    assert_eq!(result.schema, SchemaTag::Rag2);
    assert_eq!(result.metadata.routing.source, RoutingSource::Forced);
    assert_eq!(result.metadata.routing.confidence, 1.0);
    assert_eq!(text.analyze_calls.load(Ordering::SeqCst), 0);
}

// ── Determinism ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn runs_are_idempotent_apart_from_ids() {
    let fixture = manual_fixture().picture(0, 3).picture(1, 3).picture(1, 4);
    let source = xlsx(&fixture);
    let make = || {
        pipeline(
            PipelineConfig::default(),
            StubText::agreeable(),
            StubVision::new()
                .describe(&media(1), "A")
                .describe(&media(2), "B")
                .fail(&media(3)),
        )
    };

    let first = make().run(&source).await.unwrap();
    let second = make().run(&source).await.unwrap();

    assert_eq!(without_ids(&first.records), without_ids(&second.records));
    assert_eq!(first.validation, second.validation);
    assert_eq!(first.degradations, second.degradations);
    assert_ne!(first.records[0].id(), second.records[0].id());
}

// ── Validation and metadata ──────────────────────────────────────────────────

#[tokio::test]
async fn complete_records_meet_the_threshold() {
    let p = pipeline(
        PipelineConfig::default(),
        StubText::agreeable(),
        StubVision::new(),
    );

    let result = p.run(&csv(ARTICLES_CSV)).await.unwrap();

    assert_eq!(result.validation.valid_records, 3);
    assert!(result.validation.meets_threshold);
    assert!(result.validation.quality_score > 0.0);
    assert_eq!(result.metadata.rule_origin, RuleOrigin::Conceptualization);
    for stage in [
        PipelineStage::Ingesting,
        PipelineStage::Routing,
        PipelineStage::Standardizing,
        PipelineStage::Validating,
    ] {
        assert!(
            result.metadata.stage_duration_ms(stage).is_some(),
            "no timing for {stage}"
        );
    }
}

#[tokio::test]
async fn result_serializes_to_json() {
    let p = pipeline(
        PipelineConfig::default(),
        StubText::agreeable(),
        StubVision::new(),
    );
    let result = p.run(&csv(ARTICLES_CSV)).await.unwrap();

    let json = serde_json::to_value(&result).unwrap();
    let first = &json["records"][0];
    assert_eq!(first["titulo"], "Montaje");
    assert!(first["image_caption"].is_null());
    assert_eq!(json["schema"], "rag1");
}

// ── Analysis ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn analyze_previews_without_describing_images() {
    let fixture = manual_fixture().picture(1, 3);
    let vision = Arc::new(StubVision::new().describe(&media(1), "A"));
    let text = Arc::new(StubText::agreeable());
    let p = pipeline_with(text.clone(), vision.clone());

    let report = p.analyze(&xlsx(&fixture)).await.unwrap();

    assert_eq!(report.row_count, 2);
    assert_eq!(report.image_count, 1);
    assert_eq!(report.rows_with_images, vec![1]);
    assert_eq!(report.routing.schema, SchemaTag::Rag1);
    assert_eq!(report.file.columns, vec!["titulo", "texto", "numero"]);
    assert!(!report.sample.is_empty());
    assert_eq!(vision.call_count(), 0);
    assert_eq!(text.conceptualize_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn analyze_reports_ingestion_failure() {
    let p = pipeline(
        PipelineConfig::default(),
        StubText::agreeable(),
        StubVision::new(),
    );
    let source = SourceFile::new(b"\x00\x00\x00".to_vec(), "vacio.csv").unwrap();

    let failure = p.analyze(&source).await.unwrap_err();
    assert!(failure.is_ingestion_failure());
}
