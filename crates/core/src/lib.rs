pub mod calibration;
pub mod decode;
pub mod hub;
pub mod preprocess;
pub mod recognize;
pub mod session;
pub mod smoke;
pub mod tensor;
pub mod vocab;

pub use calibration::{CalibrationBatch, CalibrationFeeder, CalibrationSource};
pub use decode::{
    DEFAULT_MAX_LENGTH, DecodeOptions, DecodeOutcome, FinishReason, GreedyDecoder, SpecialTokens,
    Vocabulary, select_greedy,
};
pub use hub::{DEFAULT_HUB_MODEL, HubModel};
pub use preprocess::{PreprocessConfig, Preprocessor, Resample, TrOcrPreprocessor};
pub use recognize::{Recognition, TrOcrRecognizer};
pub use session::{
    InputBindings, ModelSession, TensorDim, TensorInfo, input_name, run_encoder, run_first_output,
};
pub use smoke::{DUMMY_ENCODER_STATES_SHAPE, SmokeReport, smoke_decoder, smoke_encoder};
pub use vocab::{SpecialTokenNames, TokenizerSource, TokenizerVocabulary};
