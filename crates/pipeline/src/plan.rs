//! Declarative stage plan and its rendering into a Pod and a ConfigMap.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, EmptyDirVolumeSource, KeyToPath, Pod, PodSpec,
    Volume as PodVolume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kratix_core::{naming, LabelSelector, ResourceKind};

use crate::{paths, PipelineError};

pub const READER_STAGE: &str = "reader";
pub const WRITER_STAGE: &str = "writer";

pub const INPUT_VOLUME: &str = "input";
pub const OUTPUT_VOLUME: &str = "output";
pub const METADATA_VOLUME: &str = "metadata";
pub const SELECTORS_VOLUME: &str = "promise-cluster-selectors";

/// What a single launch is about.
#[derive(Debug, Clone)]
pub struct PipelineRequest<'a> {
    pub kind: &'a ResourceKind,
    pub namespace: &'a str,
    pub name: &'a str,
    pub promise_id: &'a str,
    pub images: &'a [String],
    pub cluster_selector: &'a LabelSelector,
}

impl PipelineRequest<'_> {
    pub fn request_id(&self) -> String {
        naming::request_identifier(self.promise_id, self.namespace, self.name)
    }
}

/// Process-wide knobs for every launch.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Namespace the pod and its config map are created in.
    pub namespace: String,
    pub reader_image: String,
    pub work_creator_image: String,
    /// Short suffix that makes the pod name unique per launch.
    pub pod_suffix: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub volume: &'static str,
    pub path: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    pub name: String,
    pub image: String,
    /// `None` leaves the entrypoint to the image author.
    pub command: Option<Vec<String>>,
    pub mounts: Vec<Mount>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeSource {
    Scratch,
    /// Single key of a config map projected to a fixed file name.
    ConfigFile { config_map: String, key: &'static str, path: &'static str },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    pub name: &'static str,
    pub source: VolumeSource,
}

/// One request's pipeline: ordered stages ending in the writer, and the
/// staging areas they share.
#[derive(Debug, Clone)]
pub struct PipelinePlan {
    pub pod_name: String,
    pub namespace: String,
    pub service_account: String,
    pub request_id: String,
    pub labels: BTreeMap<String, String>,
    /// Run to completion one after another, in order.
    pub stages: Vec<Stage>,
    pub writer: Stage,
    pub volumes: Vec<Volume>,
    pub config_map_name: String,
    pub selectors: String,
}

fn stage_mounts() -> Vec<Mount> {
    vec![
        Mount { volume: INPUT_VOLUME, path: paths::STAGE_INPUT },
        Mount { volume: OUTPUT_VOLUME, path: paths::STAGE_OUTPUT },
        Mount { volume: METADATA_VOLUME, path: paths::STAGE_METADATA },
    ]
}

fn reader_command(req: &PipelineRequest<'_>) -> String {
    let target = if req.kind.group.is_empty() {
        req.kind.kind.to_lowercase()
    } else {
        format!("{}.{}", req.kind.kind.to_lowercase(), req.kind.group)
    };
    format!(
        "kubectl get {} {} --namespace {} -oyaml > {}/{}",
        target,
        req.name,
        req.namespace,
        paths::STAGE_OUTPUT,
        paths::REQUEST_OBJECT_FILE
    )
}

impl PipelinePlan {
    pub fn build(req: &PipelineRequest<'_>, settings: &PipelineSettings) -> Result<Self, PipelineError> {
        if req.images.is_empty() {
            return Err(PipelineError::Invalid(format!("{}: no pipeline images", req.promise_id)));
        }
        if let Some(bad) = req.images.iter().find(|i| i.trim().is_empty()) {
            return Err(PipelineError::Invalid(format!("{}: blank pipeline image {:?}", req.promise_id, bad)));
        }
        let request_id = req.request_id();
        let config_map_name = naming::selectors_config_map(&request_id);

        let mut stages = Vec::with_capacity(req.images.len() + 1);
        stages.push(Stage {
            name: READER_STAGE.to_string(),
            image: settings.reader_image.clone(),
            command: Some(vec!["sh".into(), "-c".into(), reader_command(req)]),
            mounts: vec![Mount { volume: INPUT_VOLUME, path: paths::STAGE_OUTPUT }],
        });
        for (i, image) in req.images.iter().enumerate() {
            stages.push(Stage {
                name: format!("xaas-request-pipeline-stage-{}", i + 1),
                image: image.clone(),
                command: None,
                mounts: stage_mounts(),
            });
        }

        let writer = Stage {
            name: WRITER_STAGE.to_string(),
            image: settings.work_creator_image.clone(),
            command: Some(vec![
                "kratix".into(),
                "work-creator".into(),
                "--identifier".into(),
                request_id.clone(),
                "--input-directory".into(),
                paths::WORK_CREATOR_ROOT.into(),
                "--namespace".into(),
                settings.namespace.clone(),
            ]),
            mounts: vec![
                Mount { volume: OUTPUT_VOLUME, path: paths::WRITER_INPUT },
                Mount { volume: METADATA_VOLUME, path: paths::WRITER_METADATA },
                Mount { volume: SELECTORS_VOLUME, path: paths::WRITER_SYSTEM },
            ],
        };

        let volumes = vec![
            Volume { name: INPUT_VOLUME, source: VolumeSource::Scratch },
            Volume { name: OUTPUT_VOLUME, source: VolumeSource::Scratch },
            Volume { name: METADATA_VOLUME, source: VolumeSource::Scratch },
            Volume {
                name: SELECTORS_VOLUME,
                source: VolumeSource::ConfigFile {
                    config_map: config_map_name.clone(),
                    key: paths::SELECTORS_KEY,
                    path: paths::SELECTORS_FILE,
                },
            },
        ];

        let labels = BTreeMap::from([
            (naming::PROMISE_ID_LABEL.to_string(), req.promise_id.to_string()),
            (naming::REQUEST_ID_LABEL.to_string(), request_id.clone()),
        ]);

        Ok(Self {
            pod_name: naming::pipeline_pod(req.promise_id, &settings.pod_suffix),
            namespace: settings.namespace.clone(),
            service_account: naming::pipeline_service_account(req.promise_id),
            request_id,
            labels,
            stages,
            writer,
            volumes,
            config_map_name,
            selectors: req.cluster_selector.to_string(),
        })
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().chain(std::iter::once(&self.writer)).map(|s| s.name.as_str()).collect()
    }

    fn meta(&self, name: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(self.namespace.clone()),
            labels: Some(self.labels.clone()),
            ..Default::default()
        }
    }

    /// Stages become init containers so they run strictly in order; the writer is the main container.
    pub fn pod(&self) -> Pod {
        Pod {
            metadata: self.meta(&self.pod_name),
            spec: Some(PodSpec {
                restart_policy: Some("OnFailure".into()),
                service_account_name: Some(self.service_account.clone()),
                init_containers: Some(self.stages.iter().map(container).collect()),
                containers: vec![container(&self.writer)],
                volumes: Some(self.volumes.iter().map(pod_volume).collect()),
                ..Default::default()
            }),
            status: None,
        }
    }

    pub fn config_map(&self) -> ConfigMap {
        ConfigMap {
            metadata: self.meta(&self.config_map_name),
            data: Some(BTreeMap::from([(paths::SELECTORS_KEY.to_string(), self.selectors.clone())])),
            ..Default::default()
        }
    }
}

fn container(stage: &Stage) -> Container {
    Container {
        name: stage.name.clone(),
        image: Some(stage.image.clone()),
        command: stage.command.clone(),
        volume_mounts: Some(
            stage
                .mounts
                .iter()
                .map(|m| VolumeMount { name: m.volume.to_string(), mount_path: m.path.to_string(), ..Default::default() })
                .collect(),
        ),
        ..Default::default()
    }
}

fn pod_volume(v: &Volume) -> PodVolume {
    match &v.source {
        VolumeSource::Scratch => PodVolume {
            name: v.name.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        },
        VolumeSource::ConfigFile { config_map, key, path } => PodVolume {
            name: v.name.to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: Some(config_map.clone()),
                items: Some(vec![KeyToPath { key: key.to_string(), path: path.to_string(), mode: None }]),
                ..Default::default()
            }),
            ..Default::default()
        },
    }
}
