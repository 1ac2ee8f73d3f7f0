//! Image caption synthesis for RAG1 records.
//!
//! A row with one anchored image gets a single combined vision call and the
//! description is used as the caption. A row with two or more images gets one
//! call per image through a single-worker [`CallQueue`], in anchor order; the
//! descriptions that came back are renumbered and joined with the step
//! template:
//!
//! ```text
//! Paso 1 (Imagen 1): A. Paso 2 (Imagen 2): B.
//! ```
//!
//! A failed call only removes that image from the caption. When nothing
//! came back the caption is null.

use crate::capability::answer::{clean_answer, clean_description};
use crate::capability::VisionCapability;
use crate::error::{Degradation, DegradationKind};
use crate::pipeline::images::ImageAsset;
use crate::pipeline::queue::CallQueue;
use crate::pipeline::PipelineStage;
use tracing::{debug, warn};

/// Caption plus the per-image failures behind it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CaptionOutcome {
    pub caption: Option<String>,
    pub degradations: Vec<Degradation>,
}

/// Join descriptions with the step template, numbering from 1.
///
/// Descriptions must already be cleaned (no trailing period).
pub fn format_caption<S: AsRef<str>>(descriptions: &[S]) -> Option<String> {
    if descriptions.is_empty() {
        return None;
    }
    let steps: Vec<String> = descriptions
        .iter()
        .enumerate()
        .map(|(i, d)| format!("Paso {n} (Imagen {n}): {}.", d.as_ref(), n = i + 1))
        .collect();
    Some(steps.join(" "))
}

fn vision_failure(row: usize, image: usize, detail: String) -> Degradation {
    let d = Degradation::new(
        DegradationKind::VisionAnalysisFailure,
        PipelineStage::Standardizing,
        detail,
    )
    .at_row(row)
    .at_image(image);
    warn!("{}", d);
    d
}

/// Build the caption for one row from its anchored images.
pub async fn synthesize_caption(
    row: usize,
    images: &[ImageAsset],
    vision: &dyn VisionCapability,
    queue: &CallQueue,
) -> CaptionOutcome {
    match images {
        [] => CaptionOutcome::default(),
        [single] => single_image_caption(row, single, vision).await,
        _ => step_caption(row, images, vision, queue).await,
    }
}

async fn single_image_caption(
    row: usize,
    image: &ImageAsset,
    vision: &dyn VisionCapability,
) -> CaptionOutcome {
    match vision.describe_images(&[image]).await {
        Ok(descriptions) => {
            if descriptions.len() > 1 {
                debug!(
                    "Row {}: {} descriptions for one image, keeping the first",
                    row,
                    descriptions.len()
                );
            }
            let caption = descriptions
                .into_iter()
                .next()
                .flatten()
                .map(|d| clean_answer(&d))
                .filter(|d| !d.is_empty());
            if caption.is_none() {
                debug!("Row {}: image 1 has no description", row);
            }
            CaptionOutcome {
                caption,
                degradations: Vec::new(),
            }
        }
        Err(e) => CaptionOutcome {
            caption: None,
            degradations: vec![vision_failure(row, 1, e.to_string())],
        },
    }
}

async fn step_caption(
    row: usize,
    images: &[ImageAsset],
    vision: &dyn VisionCapability,
    queue: &CallQueue,
) -> CaptionOutcome {
    let results = queue
        .run(images.iter().enumerate(), |(i, asset)| async move {
            (i + 1, vision.describe_image(asset).await)
        })
        .await;

    let mut descriptions = Vec::with_capacity(results.len());
    let mut degradations = Vec::new();
    for (image, result) in results {
        match result {
            Ok(Some(raw)) => match clean_description(&raw) {
                Some(d) => descriptions.push(d),
                None => debug!("Row {}: image {} has an empty description", row, image),
            },
            Ok(None) => debug!("Row {}: image {} has no description", row, image),
            Err(e) => degradations.push(vision_failure(row, image, e.to_string())),
        }
    }

    debug!(
        "Row {}: {}/{} image descriptions",
        row,
        descriptions.len(),
        images.len()
    );
    CaptionOutcome {
        caption: format_caption(&descriptions),
        degradations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::DisabledCapabilities;
    use crate::error::CapabilityError;
    use crate::pipeline::images::{AnchorPosition, SourceImageFormat};
    use async_trait::async_trait;

    fn asset(path: &str) -> ImageAsset {
        ImageAsset {
            payload: vec![0u8; 4],
            source_format: SourceImageFormat::Png,
            width: 1,
            height: 1,
            anchor: AnchorPosition {
                row: 1,
                col: 0,
                row_offset: 0,
                col_offset: 0,
            },
            media_path: path.to_string(),
        }
    }

    /// Answers by media path; "fail" paths error, "blank" paths have nothing.
    struct ByPath;

    #[async_trait]
    impl VisionCapability for ByPath {
        async fn describe_image(
            &self,
            asset: &ImageAsset,
        ) -> Result<Option<String>, CapabilityError> {
            match asset.media_path.as_str() {
                p if p.starts_with("fail") => Err(CapabilityError::CallFailed {
                    retries: 0,
                    detail: "boom".into(),
                }),
                p if p.starts_with("blank") => Ok(None),
                p => Ok(Some(format!("{p}."))),
            }
        }

        async fn describe_images(
            &self,
            assets: &[&ImageAsset],
        ) -> Result<Vec<Option<String>>, CapabilityError> {
            Ok(assets
                .iter()
                .map(|a| Some(format!("  {} combined.  ", a.media_path)))
                .collect())
        }
    }

    #[test]
    fn template_numbers_from_one() {
        assert_eq!(
            format_caption(&["A", "B", "C"]).as_deref(),
            Some("Paso 1 (Imagen 1): A. Paso 2 (Imagen 2): B. Paso 3 (Imagen 3): C.")
        );
        assert_eq!(format_caption::<&str>(&[]), None);
    }

    #[tokio::test]
    async fn no_images_no_caption() {
        let out = synthesize_caption(0, &[], &ByPath, &CallQueue::single_worker()).await;
        assert_eq!(out, CaptionOutcome::default());
    }

    #[tokio::test]
    async fn single_image_is_used_verbatim() {
        let out = synthesize_caption(0, &[asset("Cat")], &ByPath, &CallQueue::single_worker()).await;
        assert_eq!(out.caption.as_deref(), Some("Cat combined."));
        assert!(out.degradations.is_empty());
    }

    /// Returns more descriptions than images were sent.
    struct Chatty;

    #[async_trait]
    impl VisionCapability for Chatty {
        async fn describe_image(
            &self,
            _asset: &ImageAsset,
        ) -> Result<Option<String>, CapabilityError> {
            Ok(Some("single".into()))
        }

        async fn describe_images(
            &self,
            _assets: &[&ImageAsset],
        ) -> Result<Vec<Option<String>>, CapabilityError> {
            Ok(vec![Some("first".into()), Some("second".into()), None])
        }
    }

    #[tokio::test]
    async fn single_image_keeps_first_description() {
        let out = synthesize_caption(0, &[asset("A")], &Chatty, &CallQueue::single_worker()).await;
        assert_eq!(out.caption.as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn failures_are_skipped_and_renumbered() {
        let images = [asset("fail-1"), asset("B"), asset("blank"), asset("D")];
        let out = synthesize_caption(7, &images, &ByPath, &CallQueue::single_worker()).await;
        assert_eq!(
            out.caption.as_deref(),
            Some("Paso 1 (Imagen 1): B. Paso 2 (Imagen 2): D.")
        );
        assert_eq!(out.degradations.len(), 1);
        assert_eq!(out.degradations[0].row, Some(7));
        assert_eq!(out.degradations[0].image, Some(1));
    }

    #[tokio::test]
    async fn unavailable_vision_gives_null_caption() {
        let caps = DisabledCapabilities::default();
        let images = [asset("A"), asset("B")];
        let out = synthesize_caption(0, &images, &caps, &CallQueue::single_worker()).await;
        assert_eq!(out.caption, None);
        assert_eq!(out.degradations.len(), 2);
        assert!(out
            .degradations
            .iter()
            .all(|d| d.kind == DegradationKind::VisionAnalysisFailure));
    }
}
