pub mod document;
pub mod question;
pub mod questionnaire;
pub mod section;
pub mod step;

pub use document::FileRequirement;
pub use question::{Constraint, QuestionSpec, QuestionType};
pub use questionnaire::{Presentation, QuestionnaireSpec};
pub use section::SectionSpec;
pub use step::{NextRule, StepId, StepSpec};
