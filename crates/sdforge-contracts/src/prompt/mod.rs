mod completion;
mod weights;

pub use completion::{
    resolve, suggest, CompletionContext, CompletionTrigger, DEFAULT_MIN_COMPLETION_LENGTH,
};
pub use weights::{
    adjust, format_weight, parse, render, shortcut_direction, EditorKey, WeightDirection,
    WeightEdit, WeightedToken, WEIGHT_STEP,
};
