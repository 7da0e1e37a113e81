//! Amazon Athena backend for [`QueryCatalog`].
//!
//! Listing maps to `ListQueryExecutions`, describing to
//! `BatchGetQueryExecution`. SDK retries are disabled; callers retry through
//! their [`RetryPolicy`](crate::retry::RetryPolicy).

use async_trait::async_trait;
use aws_sdk_athena::Client;
use aws_sdk_athena::config::retry::RetryConfig;
use aws_sdk_athena::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_athena::primitives::DateTime as SmithyDateTime;
use aws_sdk_athena::types::{
    AclConfiguration, AthenaError, EncryptionConfiguration, EngineVersion,
    ManagedQueryResultsConfiguration, QueryExecution, QueryExecutionContext,
    QueryExecutionStatistics, QueryExecutionStatus, QueryResultsS3AccessGrantsConfiguration,
    ResultConfiguration, ResultReuseByAgeConfiguration, ResultReuseConfiguration,
    ResultReuseInformation,
};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use tracing::debug;

use super::{
    DescribeOutput, ExecutionPage, ExecutionRecord, QueryCatalog, RecordValue,
    UnprocessedExecution,
};
use crate::config::CatalogConfig;
use crate::error::{CatalogError, CatalogOperation};

/// Service error codes worth another attempt.
const TRANSIENT_ERROR_CODES: &[&str] = &[
    "InternalServerException",
    "TooManyRequestsException",
    "ThrottlingException",
    "ServiceUnavailableException",
    "RequestTimeout",
];

/// Athena-backed query catalog.
#[derive(Debug, Clone)]
pub struct AthenaCatalog {
    client: Client,
    work_group: Option<String>,
    page_size: Option<i32>,
}

impl AthenaCatalog {
    /// Build a client from the default AWS provider chain.
    pub async fn from_config(config: &CatalogConfig) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(aws_config::Region::new(region.clone()));
        }
        let sdk_config = loader.load().await;

        let athena_config = aws_sdk_athena::config::Builder::from(&sdk_config)
            .retry_config(RetryConfig::disabled())
            .build();

        Self::from_client(Client::from_conf(athena_config), config)
    }

    /// Wrap an existing client.
    pub fn from_client(client: Client, config: &CatalogConfig) -> Self {
        Self {
            client,
            work_group: config.work_group.clone(),
            page_size: config.page_size,
        }
    }
}

#[async_trait]
impl QueryCatalog for AthenaCatalog {
    async fn list_executions(
        &self,
        next_token: Option<String>,
    ) -> Result<ExecutionPage, CatalogError> {
        let output = self
            .client
            .list_query_executions()
            .set_next_token(next_token)
            .set_work_group(self.work_group.clone())
            .set_max_results(self.page_size)
            .send()
            .await
            .map_err(|e| classify(CatalogOperation::ListExecutions, e))?;

        let page = ExecutionPage {
            ids: output.query_execution_ids().to_vec(),
            next_token: output.next_token().map(str::to_string),
        };
        debug!(
            "Listed {} execution ids (more: {})",
            page.ids.len(),
            page.next_token.is_some()
        );
        Ok(page)
    }

    async fn batch_get_executions(&self, ids: &[String]) -> Result<DescribeOutput, CatalogError> {
        let output = self
            .client
            .batch_get_query_execution()
            .set_query_execution_ids(Some(ids.to_vec()))
            .send()
            .await
            .map_err(|e| classify(CatalogOperation::BatchGetExecutions, e))?;

        let records = output
            .query_executions()
            .iter()
            .map(execution_record)
            .collect();

        let unprocessed = output
            .unprocessed_query_execution_ids()
            .iter()
            .map(|u| UnprocessedExecution {
                id: u.query_execution_id().unwrap_or_default().to_string(),
                error_code: u.error_code().map(str::to_string),
                error_message: u.error_message().map(str::to_string),
            })
            .collect();

        Ok(DescribeOutput {
            records,
            unprocessed,
        })
    }
}

/// Map an SDK failure onto the transient/fatal split.
fn classify<E>(operation: CatalogOperation, err: SdkError<E>) -> CatalogError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    let message = DisplayErrorContext(&err).to_string();
    let transient = match &err {
        SdkError::ServiceError(service_err) => is_transient_code(service_err.err().code()),
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            true
        }
        _ => false,
    };

    if transient {
        CatalogError::Transient { operation, message }
    } else {
        CatalogError::Fatal { operation, message }
    }
}

fn is_transient_code(code: Option<&str>) -> bool {
    code.is_some_and(|code| TRANSIENT_ERROR_CODES.contains(&code))
}

/// Builds a map, skipping fields the service left unset.
#[derive(Default)]
struct Fields(IndexMap<String, RecordValue>);

impl Fields {
    fn set(&mut self, key: &str, value: Option<impl Into<RecordValue>>) -> &mut Self {
        if let Some(value) = value {
            self.0.insert(key.to_string(), value.into());
        }
        self
    }

    fn set_map(&mut self, key: &str, value: Option<Fields>) -> &mut Self {
        if let Some(fields) = value.filter(|f| !f.0.is_empty()) {
            self.0.insert(key.to_string(), RecordValue::Map(fields.0));
        }
        self
    }

    fn build(self) -> IndexMap<String, RecordValue> {
        self.0
    }
}

fn timestamp(ts: &SmithyDateTime) -> Option<RecordValue> {
    DateTime::<Utc>::from_timestamp(ts.secs(), ts.subsec_nanos())
        .map(|dt| RecordValue::ZonedTimestamp(dt.fixed_offset()))
}

/// Convert one `QueryExecution` into a record keyed by the service's field
/// names, in the order the service documents them.
fn execution_record(execution: &QueryExecution) -> ExecutionRecord {
    let mut fields = Fields::default();
    fields
        .set("QueryExecutionId", execution.query_execution_id())
        .set("Query", execution.query())
        .set(
            "StatementType",
            execution.statement_type().map(|t| t.as_str()),
        )
        .set_map(
            "ManagedQueryResultsConfiguration",
            execution
                .managed_query_results_configuration()
                .map(managed_results),
        )
        .set_map(
            "ResultConfiguration",
            execution.result_configuration().map(result_configuration),
        )
        .set_map(
            "ResultReuseConfiguration",
            execution.result_reuse_configuration().map(result_reuse),
        )
        .set_map(
            "QueryExecutionContext",
            execution.query_execution_context().map(execution_context),
        )
        .set_map("Status", execution.status().map(status))
        .set_map("Statistics", execution.statistics().map(statistics))
        .set("WorkGroup", execution.work_group())
        .set_map("EngineVersion", execution.engine_version().map(engine_version));

    let parameters = execution.execution_parameters();
    if !parameters.is_empty() {
        fields.set(
            "ExecutionParameters",
            Some(RecordValue::List(
                parameters.iter().map(|p| RecordValue::from(p.as_str())).collect(),
            )),
        );
    }

    fields
        .set("SubstatementType", execution.substatement_type())
        .set_map(
            "QueryResultsS3AccessGrantsConfiguration",
            execution
                .query_results_s3_access_grants_configuration()
                .map(access_grants),
        );

    fields.build()
}

fn managed_results(config: &ManagedQueryResultsConfiguration) -> Fields {
    let mut fields = Fields::default();
    fields.set("Enabled", Some(config.enabled())).set_map(
        "EncryptionConfiguration",
        config.encryption_configuration().map(|encryption| {
            let mut key = Fields::default();
            key.set("KmsKey", Some(encryption.kms_key()));
            key
        }),
    );
    fields
}

fn result_configuration(config: &ResultConfiguration) -> Fields {
    let mut fields = Fields::default();
    fields
        .set("OutputLocation", config.output_location())
        .set_map(
            "EncryptionConfiguration",
            config.encryption_configuration().map(encryption),
        )
        .set("ExpectedBucketOwner", config.expected_bucket_owner())
        .set_map("AclConfiguration", config.acl_configuration().map(acl));
    fields
}

fn encryption(config: &EncryptionConfiguration) -> Fields {
    let mut fields = Fields::default();
    fields
        .set("EncryptionOption", Some(config.encryption_option().as_str()))
        .set("KmsKey", config.kms_key());
    fields
}

fn acl(config: &AclConfiguration) -> Fields {
    let mut fields = Fields::default();
    fields.set("S3AclOption", Some(config.s3_acl_option().as_str()));
    fields
}

fn result_reuse(config: &ResultReuseConfiguration) -> Fields {
    let mut fields = Fields::default();
    fields.set_map(
        "ResultReuseByAgeConfiguration",
        config.result_reuse_by_age_configuration().map(reuse_by_age),
    );
    fields
}

fn reuse_by_age(config: &ResultReuseByAgeConfiguration) -> Fields {
    let mut fields = Fields::default();
    fields
        .set("Enabled", Some(config.enabled()))
        .set("MaxAgeInMinutes", config.max_age_in_minutes());
    fields
}

fn execution_context(context: &QueryExecutionContext) -> Fields {
    let mut fields = Fields::default();
    fields
        .set("Database", context.database())
        .set("Catalog", context.catalog());
    fields
}

fn status(status: &QueryExecutionStatus) -> Fields {
    let mut fields = Fields::default();
    fields
        .set("State", status.state().map(|s| s.as_str()))
        .set("StateChangeReason", status.state_change_reason())
        .set(
            "SubmissionDateTime",
            status.submission_date_time().and_then(timestamp),
        )
        .set(
            "CompletionDateTime",
            status.completion_date_time().and_then(timestamp),
        )
        .set_map("AthenaError", status.athena_error().map(athena_error));
    fields
}

fn athena_error(error: &AthenaError) -> Fields {
    let mut fields = Fields::default();
    fields
        .set("ErrorCategory", error.error_category())
        .set("ErrorType", error.error_type())
        .set("Retryable", Some(error.retryable()))
        .set("ErrorMessage", error.error_message());
    fields
}

fn statistics(stats: &QueryExecutionStatistics) -> Fields {
    let mut fields = Fields::default();
    fields
        .set(
            "EngineExecutionTimeInMillis",
            stats.engine_execution_time_in_millis(),
        )
        .set("DataScannedInBytes", stats.data_scanned_in_bytes())
        .set("DataManifestLocation", stats.data_manifest_location())
        .set(
            "TotalExecutionTimeInMillis",
            stats.total_execution_time_in_millis(),
        )
        .set(
            "QueryQueueTimeInMillis",
            stats.query_queue_time_in_millis(),
        )
        .set(
            "ServicePreProcessingTimeInMillis",
            stats.service_pre_processing_time_in_millis(),
        )
        .set(
            "QueryPlanningTimeInMillis",
            stats.query_planning_time_in_millis(),
        )
        .set(
            "ServiceProcessingTimeInMillis",
            stats.service_processing_time_in_millis(),
        )
        .set_map(
            "ResultReuseInformation",
            stats.result_reuse_information().map(reuse_information),
        )
        .set("DpuCount", stats.dpu_count());
    fields
}

fn reuse_information(info: &ResultReuseInformation) -> Fields {
    let mut fields = Fields::default();
    fields.set("ReusedPreviousResult", Some(info.reused_previous_result()));
    fields
}

fn engine_version(version: &EngineVersion) -> Fields {
    let mut fields = Fields::default();
    fields
        .set("SelectedEngineVersion", version.selected_engine_version())
        .set("EffectiveEngineVersion", version.effective_engine_version());
    fields
}

fn access_grants(config: &QueryResultsS3AccessGrantsConfiguration) -> Fields {
    let mut fields = Fields::default();
    fields
        .set("EnableS3AccessGrants", Some(config.enable_s3_access_grants()))
        .set("CreateUserLevelPrefix", config.create_user_level_prefix())
        .set(
            "AuthenticationType",
            Some(config.authentication_type().as_str()),
        );
    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_athena::types::{
        AuthenticationType, EncryptionOption, ManagedQueryResultsEncryptionConfiguration,
        QueryExecutionState, S3AclOption, StatementType,
    };

    #[test]
    fn test_transient_codes() {
        assert!(is_transient_code(Some("TooManyRequestsException")));
        assert!(is_transient_code(Some("InternalServerException")));
        assert!(!is_transient_code(Some("InvalidRequestException")));
        assert!(!is_transient_code(Some("AccessDeniedException")));
        assert!(!is_transient_code(None));
    }

    #[test]
    fn test_execution_record_uses_service_field_names() {
        let execution = QueryExecution::builder()
            .query_execution_id("a1b2c3")
            .query("SELECT 1")
            .statement_type(StatementType::Dml)
            .work_group("primary")
            .query_execution_context(QueryExecutionContext::builder().database("logs").build())
            .status(
                QueryExecutionStatus::builder()
                    .state(QueryExecutionState::Succeeded)
                    .submission_date_time(SmithyDateTime::from_secs(1_672_531_200))
                    .build(),
            )
            .statistics(
                QueryExecutionStatistics::builder()
                    .data_scanned_in_bytes(1024)
                    .build(),
            )
            .build();

        let record = execution_record(&execution);
        let keys: Vec<&str> = record.keys().map(String::as_str).collect();
        assert_eq!(
            keys,
            vec![
                "QueryExecutionId",
                "Query",
                "StatementType",
                "QueryExecutionContext",
                "Status",
                "Statistics",
                "WorkGroup"
            ]
        );

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["StatementType"], "DML");
        assert_eq!(json["QueryExecutionContext"]["Database"], "logs");
        assert_eq!(json["Status"]["State"], "SUCCEEDED");
        assert_eq!(
            json["Status"]["SubmissionDateTime"],
            "2023-01-01T00:00:00+00:00"
        );
        assert_eq!(json["Statistics"]["DataScannedInBytes"], 1024);
    }

    fn fully_populated_execution() -> QueryExecution {
        QueryExecution::builder()
            .query_execution_id("x")
            .query("INSERT INTO t SELECT * FROM s WHERE d = ?")
            .statement_type(StatementType::Dml)
            .managed_query_results_configuration(
                ManagedQueryResultsConfiguration::builder()
                    .enabled(true)
                    .encryption_configuration(
                        ManagedQueryResultsEncryptionConfiguration::builder()
                            .kms_key("arn:aws:kms:managed")
                            .build()
                            .unwrap(),
                    )
                    .build(),
            )
            .result_configuration(
                ResultConfiguration::builder()
                    .output_location("s3://out/")
                    .encryption_configuration(
                        EncryptionConfiguration::builder()
                            .encryption_option(EncryptionOption::SseS3)
                            .build()
                            .unwrap(),
                    )
                    .expected_bucket_owner("123456789012")
                    .acl_configuration(
                        AclConfiguration::builder()
                            .s3_acl_option(S3AclOption::BucketOwnerFullControl)
                            .build()
                            .unwrap(),
                    )
                    .build(),
            )
            .result_reuse_configuration(
                ResultReuseConfiguration::builder()
                    .result_reuse_by_age_configuration(
                        ResultReuseByAgeConfiguration::builder()
                            .enabled(true)
                            .max_age_in_minutes(60)
                            .build(),
                    )
                    .build(),
            )
            .query_execution_context(
                QueryExecutionContext::builder()
                    .database("logs")
                    .catalog("AwsDataCatalog")
                    .build(),
            )
            .status(
                QueryExecutionStatus::builder()
                    .state(QueryExecutionState::Failed)
                    .state_change_reason("boom")
                    .submission_date_time(SmithyDateTime::from_secs(1_672_531_200))
                    .completion_date_time(SmithyDateTime::from_secs(1_672_531_260))
                    .athena_error(
                        AthenaError::builder()
                            .error_category(2)
                            .error_type(1001)
                            .retryable(true)
                            .error_message("boom")
                            .build(),
                    )
                    .build(),
            )
            .statistics(
                QueryExecutionStatistics::builder()
                    .engine_execution_time_in_millis(10)
                    .data_scanned_in_bytes(1024)
                    .data_manifest_location("s3://out/manifest.csv")
                    .total_execution_time_in_millis(20)
                    .query_queue_time_in_millis(1)
                    .service_pre_processing_time_in_millis(2)
                    .query_planning_time_in_millis(3)
                    .service_processing_time_in_millis(4)
                    .result_reuse_information(
                        ResultReuseInformation::builder()
                            .reused_previous_result(true)
                            .build(),
                    )
                    .dpu_count(1.5)
                    .build(),
            )
            .work_group("primary")
            .engine_version(
                EngineVersion::builder()
                    .selected_engine_version("AUTO")
                    .effective_engine_version("Athena engine version 3")
                    .build(),
            )
            .execution_parameters("2024-01-01")
            .substatement_type("INSERT")
            .query_results_s3_access_grants_configuration(
                QueryResultsS3AccessGrantsConfiguration::builder()
                    .enable_s3_access_grants(true)
                    .create_user_level_prefix(false)
                    .authentication_type(AuthenticationType::DirectoryIdentity)
                    .build()
                    .unwrap(),
            )
            .build()
    }

    #[test]
    fn test_every_described_field_is_kept() {
        let record = execution_record(&fully_populated_execution());
        let keys: Vec<&str> = record.keys().map(String::as_str).collect();
        assert_eq!(
            keys,
            vec![
                "QueryExecutionId",
                "Query",
                "StatementType",
                "ManagedQueryResultsConfiguration",
                "ResultConfiguration",
                "ResultReuseConfiguration",
                "QueryExecutionContext",
                "Status",
                "Statistics",
                "WorkGroup",
                "EngineVersion",
                "ExecutionParameters",
                "SubstatementType",
                "QueryResultsS3AccessGrantsConfiguration",
            ]
        );

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(
            json["ManagedQueryResultsConfiguration"],
            serde_json::json!({
                "Enabled": true,
                "EncryptionConfiguration": {"KmsKey": "arn:aws:kms:managed"}
            })
        );
        assert_eq!(
            json["ResultConfiguration"],
            serde_json::json!({
                "OutputLocation": "s3://out/",
                "EncryptionConfiguration": {"EncryptionOption": "SSE_S3"},
                "ExpectedBucketOwner": "123456789012",
                "AclConfiguration": {"S3AclOption": "BUCKET_OWNER_FULL_CONTROL"}
            })
        );
        assert_eq!(
            json["ResultReuseConfiguration"],
            serde_json::json!({
                "ResultReuseByAgeConfiguration": {"Enabled": true, "MaxAgeInMinutes": 60}
            })
        );
        assert_eq!(json["QueryExecutionContext"]["Catalog"], "AwsDataCatalog");
        assert_eq!(
            json["Status"],
            serde_json::json!({
                "State": "FAILED",
                "StateChangeReason": "boom",
                "SubmissionDateTime": "2023-01-01T00:00:00+00:00",
                "CompletionDateTime": "2023-01-01T00:01:00+00:00",
                "AthenaError": {
                    "ErrorCategory": 2,
                    "ErrorType": 1001,
                    "Retryable": true,
                    "ErrorMessage": "boom"
                }
            })
        );
        assert_eq!(
            json["Statistics"],
            serde_json::json!({
                "EngineExecutionTimeInMillis": 10,
                "DataScannedInBytes": 1024,
                "DataManifestLocation": "s3://out/manifest.csv",
                "TotalExecutionTimeInMillis": 20,
                "QueryQueueTimeInMillis": 1,
                "ServicePreProcessingTimeInMillis": 2,
                "QueryPlanningTimeInMillis": 3,
                "ServiceProcessingTimeInMillis": 4,
                "ResultReuseInformation": {"ReusedPreviousResult": true},
                "DpuCount": 1.5
            })
        );
        assert_eq!(
            json["EngineVersion"]["EffectiveEngineVersion"],
            "Athena engine version 3"
        );
        assert_eq!(json["ExecutionParameters"], serde_json::json!(["2024-01-01"]));
        assert_eq!(json["SubstatementType"], "INSERT");
        assert_eq!(
            json["QueryResultsS3AccessGrantsConfiguration"],
            serde_json::json!({
                "EnableS3AccessGrants": true,
                "CreateUserLevelPrefix": false,
                "AuthenticationType": "DIRECTORY_IDENTITY"
            })
        );
    }

    #[test]
    fn test_empty_nested_structures_are_omitted() {
        let execution = QueryExecution::builder()
            .query_execution_id("x")
            .result_configuration(ResultConfiguration::builder().build())
            .build();

        let record = execution_record(&execution);
        assert_eq!(record.len(), 1);
        assert!(record.contains_key("QueryExecutionId"));
    }

    #[test]
    fn test_subsecond_timestamps() {
        let ts = SmithyDateTime::from_fractional_secs(1_672_531_200, 0.5);
        let value = timestamp(&ts).unwrap();
        assert_eq!(
            serde_json::to_string(&value).unwrap(),
            r#""2023-01-01T00:00:00.500000+00:00""#
        );
    }
}
