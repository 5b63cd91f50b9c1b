//! Id types for each workload kind.

use crate::define_id;

define_id!(FineTuningJobId, "ftjob");
define_id!(BatchJobId, "batchjob");
define_id!(NotebookId, "nb");
