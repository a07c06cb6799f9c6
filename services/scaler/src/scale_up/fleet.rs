//! Fleet request assembly and create-result classification.

use fleet_events::RunnerType;
use tracing::{info, warn};

use super::CreatedBy;
use crate::collaborators::{
    tags, CapacityType, FleetOverride, FleetProvider, FleetRequest, RunnerScope,
};
use crate::config::FleetSettings;
use crate::error::{ScalerError, ScalerResult};

/// Provider error codes meaning "no capacity right now, try again later".
pub const SCALE_ERROR_CODES: &[&str] = &[
    "UnfulfillableCapacity",
    "MaxSpotInstanceCountExceeded",
    "TargetCapacityLimitExceededException",
    "RequestLimitExceeded",
    "ResourceLimitExceeded",
    "MaxSpotFleetRequestCountExceeded",
    "InsufficientInstanceCapacity",
];

pub fn is_scale_error(code: &str) -> bool {
    SCALE_ERROR_CODES.contains(&code)
}

/// Builds one batched create request over every subnet and instance type.
pub fn build_request(
    settings: &FleetSettings,
    environment: &str,
    scope: &RunnerScope,
    count: u32,
    created_by: CreatedBy,
    image_id: Option<&str>,
) -> ScalerResult<FleetRequest> {
    if settings.subnet_ids.is_empty() {
        return Err(ScalerError::Config("no subnets configured".to_string()));
    }
    if settings.instance_types.is_empty() {
        return Err(ScalerError::Config("no instance types configured".to_string()));
    }

    let overrides = settings
        .subnet_ids
        .iter()
        .flat_map(|subnet_id| {
            settings.instance_types.iter().map(move |instance_type| FleetOverride {
                subnet_id: subnet_id.clone(),
                instance_type: instance_type.clone(),
                image_id: image_id.map(str::to_string),
            })
        })
        .collect();

    Ok(FleetRequest {
        launch_template_name: settings.launch_template_name.clone(),
        overrides,
        target_capacity: count,
        capacity_type: settings.capacity_type,
        allocation_strategy: settings.allocation_strategy.clone(),
        max_spot_price: settings.max_spot_price.clone(),
        tags: machine_tags(environment, scope.runner_type, &scope.owner, created_by),
    })
}

fn machine_tags(
    environment: &str,
    runner_type: RunnerType,
    owner: &str,
    created_by: CreatedBy,
) -> Vec<(String, String)> {
    vec![
        (tags::APPLICATION.to_string(), tags::APPLICATION_VALUE.to_string()),
        (tags::ENVIRONMENT.to_string(), environment.to_string()),
        (tags::TYPE.to_string(), runner_type.to_string()),
        (tags::OWNER.to_string(), owner.to_string()),
        (tags::CREATED_BY.to_string(), created_by.as_str().to_string()),
    ]
}

/// Issues the request and classifies the result.
///
/// Returns the created instance ids. Zero created is a [`ScalerError::Scale`]
/// when any returned code is a capacity/throttling code and a
/// [`ScalerError::FleetCreation`] otherwise. Transport failures are returned
/// as provider errors untouched.
pub async fn create_fleet(
    provider: &dyn FleetProvider,
    settings: &FleetSettings,
    request: FleetRequest,
) -> ScalerResult<Vec<String>> {
    let result = provider.create_machines(&request).await?;
    let mut instance_ids = result.instance_ids;
    let mut error_codes = result.error_codes;

    let missing = request
        .target_capacity
        .saturating_sub(u32::try_from(instance_ids.len()).unwrap_or(u32::MAX));
    let failover = request.capacity_type == CapacityType::Spot
        && missing > 0
        && error_codes
            .iter()
            .any(|code| settings.on_demand_failover_on_error.contains(code));

    if failover {
        warn!(
            missing,
            error_codes = ?error_codes,
            "Spot capacity unavailable, retrying as on-demand"
        );
        let on_demand = FleetRequest {
            target_capacity: missing,
            capacity_type: CapacityType::OnDemand,
            ..request.clone()
        };
        let retried = provider.create_machines(&on_demand).await?;
        instance_ids.extend(retried.instance_ids);
        error_codes.extend(retried.error_codes);
    }

    if instance_ids.is_empty() {
        if error_codes.iter().any(|code| is_scale_error(code)) {
            warn!(error_codes = ?error_codes, "Create fleet failed, capacity exhausted");
            return Err(ScalerError::Scale(format!(
                "fleet request returned {}",
                error_codes.join(", ")
            )));
        }
        return Err(ScalerError::FleetCreation(if error_codes.is_empty() {
            "no instances created".to_string()
        } else {
            error_codes.join(", ")
        }));
    }

    if instance_ids.len() < request.target_capacity as usize {
        warn!(
            requested = request.target_capacity,
            created = instance_ids.len(),
            error_codes = ?error_codes,
            "Fleet request partially fulfilled, keeping created instances"
        );
    } else {
        info!(created = instance_ids.len(), "Fleet request fulfilled");
    }

    Ok(instance_ids)
}
