pub mod data;
pub mod fit;
pub mod model;
pub mod score;

pub use data::{DataError, load_reference_cohort};
pub use fit::{
    AgeCalibration, CohortRow, FitFailure, HdFit, HdFitIoError, MAX_CONDITION_NUMBER,
    MIN_REFERENCE_COHORT, ReferenceCohort, fit_reference_population,
};
pub use model::{HdError, HdModel, HdStatus, Unavailability};
pub use score::HdScore;
