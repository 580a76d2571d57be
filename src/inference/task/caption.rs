use std::path::Path;

use tracing::{error, info, warn};

use crate::cache::ModelHandle;
use crate::dispatch::ModalityTag;
use crate::error::GenerationError;
use crate::error_result;
use crate::inference::runtime::{RuntimeInput, SamplingParams};
use crate::inference::task::{
    expect_text, file_name, join_per_file, strip_file_echo, TaskContext, TaskHandler, TaskRequest,
};
use crate::media::MediaCodec;
use crate::recovery::RecoveryChain;

const NO_CAPTION: &str = "No caption could be generated";

pub struct CaptionHandler;

fn caption_file(
    handle: &ModelHandle,
    codec: &dyn MediaCodec,
    path: &Path,
    sampling: SamplingParams,
) -> Result<String, GenerationError> {
    let image = codec
        .decode_image(path)
        .map_err(|e| GenerationError::Runtime(format!("Failed to load image: {e:#}")))?;
    info!("Image {} loaded: {}x{} pixels", file_name(path), image.width(), image.height());

    let output = handle.run(RuntimeInput::Image {
        image,
        prompt: None,
        sampling,
    })?;
    let caption = expect_text(output)?;
    Ok(strip_file_echo(caption.trim(), path).trim().to_string())
}

impl TaskHandler for CaptionHandler {
    fn modality(&self) -> ModalityTag {
        ModalityTag::ImageToText
    }

    #[tracing::instrument(level = "info", skip_all, fields(model = %request.model_id))]
    fn run_task(&self, context: &TaskContext<'_>, request: &TaskRequest) -> String {
        let image_paths = match &request.parsed {
            Ok(parsed) => parsed.image_paths(),
            Err(err) => {
                warn!("{err}");
                Vec::new()
            }
        };
        if image_paths.is_empty() {
            return error_result!(
                "No valid image file paths found in input. Input received: {}",
                request.raw_input
            );
        }

        let handle = match context
            .cache
            .resolve(&request.model_request(ModalityTag::ImageToText))
        {
            Ok(handle) => handle,
            Err(err) => return error_result!("Failed to load model or processor: {}", err),
        };

        let sampling = SamplingParams {
            num_beams: 5,
            ..request.options.sampling()
        };

        info!("Processing {} image file(s)", image_paths.len());
        let results = image_paths
            .iter()
            .enumerate()
            .map(|(i, path)| {
                info!("Image {}/{}: {}", i + 1, image_paths.len(), file_name(path));
                let sampling = sampling.clone();
                RecoveryChain::new("image-to-text")
                    .step("caption", || caption_file(&handle, context.codec, path, sampling))
                    .run(|failures| match failures.last().map(|f| &f.error) {
                        Some(GenerationError::EmptyOutput) | None => NO_CAPTION.to_string(),
                        Some(err) => {
                            error!("Error processing image {}: {err}", i + 1);
                            format!("ERROR - {err}")
                        }
                    })
                    .into_message()
            })
            .map(|caption| {
                if caption.is_empty() {
                    NO_CAPTION.to_string()
                } else {
                    caption
                }
            })
            .collect();

        join_per_file(results)
    }
}
