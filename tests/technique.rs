use {
    std::{collections::HashMap, error::Error, sync::Arc},
    vellum::{
        driver::mock::{MockCall, MockDriver},
        prelude::*,
        technique::{BindingReflection, CompiledShader, DescriptorCount, ShaderReflection},
    },
};

#[derive(Default)]
struct Compiler(HashMap<&'static str, Vec<BindingReflection>>);

impl Compiler {
    fn with(mut self, file: &'static str, bindings: Vec<BindingReflection>) -> Self {
        self.0.insert(file, bindings);
        self
    }
}

impl ShaderCompiler for Compiler {
    fn compile(
        &self,
        file: &str,
        _stage: vk::ShaderStageFlags,
        _defines: &[(String, String)],
    ) -> Result<CompiledShader, Box<dyn Error + Send + Sync>> {
        let bindings = self.0.get(file).ok_or_else(|| format!("{file} not found"))?;

        Ok(CompiledShader {
            spirv: Arc::from([0x0723_0203u32]),
            reflection: ShaderReflection {
                bindings: bindings.clone(),
            },
        })
    }
}

fn storage_image(set: u32, name: &str) -> BindingReflection {
    BindingReflection {
        set,
        binding: 0,
        name: name.to_owned(),
        ty: vk::DescriptorType::STORAGE_IMAGE,
        count: DescriptorCount::Single,
        writable: true,
        block: None,
    }
}

fn setup(compiler: Compiler) -> (Arc<MockDriver>, Arc<dyn Driver>, Arc<Configurator>) {
    let _ = pretty_env_logger::try_init();

    let mock = Arc::new(MockDriver::default());
    let driver: Arc<dyn Driver> = mock.clone();
    let configurator = Configurator::new(&driver, Arc::new(compiler));

    (mock, driver, configurator)
}

fn grid_desc() -> TechniqueDesc {
    TechniqueDesc::new("grid")
        .with_selection("a", ["A0", "A1"])
        .with_selection("b", ["B0", "B1", "B2"])
        .with_pass(PassDesc::compute("main", "grid.comp").selection("a").selection("b"))
}

fn storage_target(driver: &Arc<dyn Driver>) -> Arc<Image> {
    Arc::new(
        Image::create(
            driver,
            ImageInfo::image_2d(
                32,
                32,
                vk::Format::R8G8B8A8_UNORM,
                vk::ImageUsageFlags::STORAGE,
            ),
        )
        .unwrap(),
    )
}

fn bound_pipelines(mock: &MockDriver) -> Vec<vk::Pipeline> {
    mock.calls()
        .into_iter()
        .filter_map(|call| match call {
            MockCall::BindPipeline(_, _, pipeline) => Some(pipeline),
            _ => None,
        })
        .collect()
}

fn descriptor_updates(mock: &MockDriver) -> usize {
    mock.calls()
        .iter()
        .filter(|call| matches!(call, MockCall::UpdateDescriptorSet(..)))
        .count()
}

#[test]
pub fn selection_grid_binds_weighted_variant() {
    let (mock, driver, configurator) =
        setup(Compiler::default().with("grid.comp", vec![storage_image(1, "target")]));
    let configuration = configurator.rebuild(&grid_desc()).unwrap();
    let (pass_index, pass_metadata) = configuration.metadata.pass("main").unwrap();

    assert_eq!(pass_metadata.weights, vec![1, 2]);
    assert_eq!(configuration.variant_count(pass_index), 6);

    let queue = ExecutionQueue::new(&driver, QueueInfo::new(0, 0)).unwrap();
    let technique = Technique::new(&configurator, "grid");
    let pass = technique.get_or_create_pass("main");

    technique
        .get_or_create_resource_binding("target")
        .set_image(&storage_target(&driver));

    assert!(technique.get_or_create_selection("a").set("A1"));
    assert!(technique.get_or_create_selection("b").set("B2"));
    assert!(!technique.get_or_create_selection("b").set("B3"));

    let mut recorder = queue.start_commands().unwrap();

    assert!(technique.bind_compute(&mut recorder, &pass, None));

    recorder.dispatch(4, 4, 1);
    queue.submit_commands(recorder).wait_for_ready().unwrap();

    assert_eq!(
        bound_pipelines(&mock),
        vec![configuration.pipeline(pass_index, 5).unwrap()]
    );
}

#[test]
pub fn graphics_pass_refused_for_compute() {
    let (_, driver, configurator) =
        setup(Compiler::default().with("grid.comp", vec![storage_image(1, "target")]));

    configurator.rebuild(&grid_desc()).unwrap();

    let queue = ExecutionQueue::new(&driver, QueueInfo::new(0, 0)).unwrap();
    let technique = Technique::new(&configurator, "grid");
    let pass = technique.get_or_create_pass("main");

    technique
        .get_or_create_resource_binding("target")
        .set_image(&storage_target(&driver));

    let mut recorder = queue.start_commands().unwrap();

    assert!(technique.is_ready());
    assert!(!technique.bind_graphics(&mut recorder, &pass, None));
    assert!(!technique.bind_compute(&mut recorder, &technique.get_or_create_pass("nope"), None));

    queue.submit_commands(recorder);
}

#[test]
pub fn readiness_follows_static_resources() {
    let (_, driver, configurator) =
        setup(Compiler::default().with("grid.comp", vec![storage_image(1, "target")]));

    configurator.rebuild(&grid_desc()).unwrap();

    let technique = Technique::new(&configurator, "grid");
    let target = technique.get_or_create_resource_binding("target");

    assert!(!technique.is_ready());

    target.set_image(&storage_target(&driver));

    assert!(technique.is_ready());

    target.clear();

    assert!(!technique.is_ready());
}

#[test]
pub fn revision_strictly_increases() {
    let (mock, driver, configurator) =
        setup(Compiler::default().with("grid.comp", vec![storage_image(1, "target")]));
    let technique = Technique::new(&configurator, "grid");
    let mut revision = technique.revision();

    configurator.rebuild(&grid_desc()).unwrap();
    technique.configuration();

    assert!(technique.revision() > revision);
    revision = technique.revision();

    technique
        .get_or_create_resource_binding("target")
        .set_image(&storage_target(&driver));

    assert!(technique.revision() > revision);
    revision = technique.revision();

    // Readiness checks neither build sets nor invalidate them
    let updates = descriptor_updates(&mock);

    assert!(technique.is_ready());
    assert!(technique.is_ready());
    assert_eq!(technique.revision(), revision);
    assert_eq!(descriptor_updates(&mock), updates);

    // Selections pick a pipeline and leave cached sets alone
    technique.get_or_create_selection("b").set_index(2);

    assert_eq!(technique.revision(), revision);

    configurator.rebuild(&grid_desc()).unwrap();
    technique.configuration();

    assert!(technique.revision() > revision);
}

#[test]
pub fn values_are_kept_across_configurations() {
    let (_, driver, configurator) =
        setup(Compiler::default().with("grid.comp", vec![storage_image(1, "target")]));
    let technique = Technique::new(&configurator, "grid");

    technique
        .get_or_create_resource_binding("target")
        .set_image(&storage_target(&driver));
    technique.get_or_create_selection("a").set_index(1);

    assert!(!technique.is_ready());

    configurator.rebuild(&grid_desc()).unwrap();

    assert!(technique.is_ready());
    assert_eq!(technique.get_or_create_selection("a").value(), 1);
}

#[test]
pub fn failed_rebuild_unconfigures_techniques() {
    let (_, driver, configurator) =
        setup(Compiler::default().with("grid.comp", vec![storage_image(1, "target")]));

    configurator.rebuild(&grid_desc()).unwrap();

    let queue = ExecutionQueue::new(&driver, QueueInfo::new(0, 0)).unwrap();
    let technique = Technique::new(&configurator, "grid");
    let pass = technique.get_or_create_pass("main");

    technique
        .get_or_create_resource_binding("target")
        .set_image(&storage_target(&driver));

    assert!(technique.is_ready());

    let revision = technique.revision();

    assert!(configurator
        .rebuild(&TechniqueDesc::new("grid").with_pass(PassDesc::compute("main", "missing.comp")))
        .is_err());
    assert!(configurator.configuration().is_none());
    assert!(!technique.is_ready());
    assert!(technique.revision() > revision);

    let mut recorder = queue.start_commands().unwrap();

    assert!(!technique.bind_compute(&mut recorder, &pass, None));

    queue.submit_commands(recorder);
}
