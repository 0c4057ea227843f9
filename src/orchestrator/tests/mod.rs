use super::*;
use crate::orchestrator::test_helpers::*;
use crate::types::ContentClass;
use std::time::Duration;
