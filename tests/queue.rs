use {
    ash::vk::Handle,
    std::sync::Arc,
    vellum::{
        driver::{
            mock::{MockCall, MockDriver},
            ImageBarrier, MemoryBarrier,
        },
        prelude::*,
    },
};

fn setup() -> (Arc<MockDriver>, Arc<dyn Driver>) {
    let _ = pretty_env_logger::try_init();

    let mock = Arc::new(MockDriver::default());
    let driver: Arc<dyn Driver> = mock.clone();

    (mock, driver)
}

fn image(driver: &Arc<dyn Driver>, usage: vk::ImageUsageFlags) -> Arc<Image> {
    Arc::new(
        Image::create(
            driver,
            ImageInfo::image_2d(64, 64, vk::Format::R8G8B8A8_UNORM, usage),
        )
        .unwrap(),
    )
}

fn image_barriers(mock: &MockDriver) -> Vec<ImageBarrier> {
    mock.barriers()
        .into_iter()
        .flat_map(|dependency| dependency.image_barriers)
        .collect()
}

fn sampled(image: &Arc<Image>) -> ImageAccess {
    ImageAccess::single(
        Image::whole(image),
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        MemoryAccess::shader_read(vk::PipelineStageFlags2::FRAGMENT_SHADER),
    )
}

#[test]
pub fn submissions_are_ordered() {
    let (mock, driver) = setup();
    let queue = ExecutionQueue::new(&driver, QueueInfo::new(0, 0)).unwrap();

    mock.set_deferred(true);

    let mut recorder = queue.start_commands().unwrap();
    recorder.dispatch(1, 1, 1);
    let first = queue.submit_commands(recorder);

    let mut recorder = queue.start_commands().unwrap();
    recorder.dispatch(1, 1, 1);
    let second = queue.submit_commands(recorder);

    assert_eq!(first.value(), 1);
    assert_eq!(second.value(), 2);
    assert_eq!(queue.submitted_value(), 2);
    assert!(!first.is_ready());
    assert!(!second.is_ready());

    second.wait_for_ready().unwrap();

    assert!(first.is_ready());
    assert_eq!(
        mock.submissions()
            .iter()
            .map(|(_, submission)| submission.signal_value)
            .collect::<Vec<_>>(),
        vec![1, 2]
    );
}

#[test]
pub fn upload_then_sample() {
    let (mock, driver) = setup();
    let queue = ExecutionQueue::new(&driver, QueueInfo::new(0, 0)).unwrap();
    let texture = image(
        &driver,
        vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
    );
    let staging = Arc::new(
        Buffer::create_from_slice(
            &driver,
            vk::BufferUsageFlags::TRANSFER_SRC,
            vec![0xffu8; 64 * 64 * 4],
        )
        .unwrap(),
    );

    let mut recorder = queue.start_commands().unwrap();
    recorder.copy_buffer_to_image(
        &staging,
        &texture,
        &[vk::BufferImageCopy {
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            },
            image_extent: vk::Extent3D {
                width: 64,
                height: 64,
                depth: 1,
            },
            ..Default::default()
        }],
    );
    queue.submit_commands(recorder);

    let barriers = image_barriers(&mock);

    assert_eq!(barriers.len(), 1);
    assert_eq!(barriers[0].old_layout, vk::ImageLayout::UNDEFINED);
    assert_eq!(barriers[0].new_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
    assert_eq!(
        Image::layout(&texture, Image::whole(&texture)),
        Some(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
    );

    mock.clear_calls();

    let mut recorder = queue.start_commands().unwrap();
    recorder.image_access(&texture, &sampled(&texture));
    queue.submit_commands(recorder);

    let barriers = image_barriers(&mock);

    assert_eq!(barriers.len(), 1);
    assert_eq!(barriers[0].old_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
    assert_eq!(barriers[0].new_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
    assert!(barriers[0]
        .src_access
        .contains(vk::AccessFlags2::TRANSFER_WRITE));
    assert!(!barriers[0].is_queue_transfer());
}

#[test]
pub fn imported_image_keeps_contents() {
    let (mock, driver) = setup();
    let queue = ExecutionQueue::new(&driver, QueueInfo::new(0, 0)).unwrap();
    let info = ImageInfo::image_2d(
        64,
        64,
        vk::Format::R8G8B8A8_UNORM,
        vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_SRC,
    )
    .to_builder()
    .default_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
    .build();
    let imported = Arc::new(Image::from_raw(&driver, vk::Image::from_raw(0xdead), info));

    assert_eq!(
        Image::layout(&imported, Image::whole(&imported)),
        Some(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
    );

    let mut recorder = queue.start_commands().unwrap();
    recorder.image_access(
        &imported,
        &ImageAccess::single(
            Image::whole(&imported),
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            MemoryAccess::TRANSFER_READ,
        ),
    );
    queue.submit_commands(recorder);

    let barriers = image_barriers(&mock);

    assert_eq!(barriers.len(), 1);
    assert_eq!(barriers[0].old_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
    assert_eq!(barriers[0].new_layout, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
}

#[test]
pub fn render_then_sample() {
    let (mock, driver) = setup();
    let queue = ExecutionQueue::new(&driver, QueueInfo::new(0, 0)).unwrap();
    let target = image(
        &driver,
        vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
    );

    let mut recorder = queue.start_commands().unwrap();
    recorder.begin_render_pass(
        &RenderPass::new().with_color(Attachment::clear(&target, ClearValue::Color([0.0; 4]))),
    );
    recorder.draw(3, 1, 0, 0);
    recorder.end_render_pass();
    recorder.image_access(&target, &sampled(&target));
    queue.submit_commands(recorder);

    let rendering = mock
        .calls()
        .into_iter()
        .find_map(|call| match call {
            MockCall::BeginRendering(_, info) => Some(info),
            _ => None,
        })
        .unwrap();

    assert_eq!(rendering.render_area.extent.width, 64);
    assert_eq!(
        rendering.color_attachments[0].clear_value,
        Some(ClearValue::Color([0.0; 4]))
    );

    let barriers = image_barriers(&mock);

    assert!(barriers.iter().any(|barrier| {
        barrier.old_layout == vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
            && barrier.new_layout == vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
            && barrier
                .src_access
                .contains(vk::AccessFlags2::COLOR_ATTACHMENT_WRITE)
    }));
    assert_eq!(
        Image::layout(&target, Image::whole(&target)),
        Some(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
    );
}

#[test]
pub fn same_family_transfer() {
    let (mock, driver) = setup();
    let graphics = ExecutionQueue::new(&driver, QueueInfo::new(0, 0)).unwrap();
    let compute = ExecutionQueue::new(&driver, QueueInfo::new(0, 1)).unwrap();
    let target = image(&driver, vk::ImageUsageFlags::STORAGE);
    let storage = ImageAccess::single(
        Image::whole(&target),
        vk::ImageLayout::GENERAL,
        MemoryAccess::shader_read_write(vk::PipelineStageFlags2::COMPUTE_SHADER),
    );

    let mut recorder = graphics.start_commands().unwrap();
    recorder.image_access(&target, &storage);
    graphics.submit_commands(recorder);
    mock.clear_calls();

    let transferred = ExecutionQueue::ownership_transfer(&graphics, &compute, &target).unwrap();
    let barriers = mock.barriers();

    assert_eq!(barriers.len(), 1);
    assert_eq!(barriers[0].memory_barriers, vec![MemoryBarrier::FULL]);
    assert!(barriers[0].image_barriers.is_empty());
    assert_eq!(mock.submissions().len(), 1);

    mock.clear_calls();

    let mut recorder = compute.start_commands().unwrap();
    recorder.image_access(&target, &storage);
    recorder.dispatch(8, 8, 1);
    compute.submit_commands(recorder);

    let submissions = mock.submissions();

    assert_eq!(submissions.len(), 1);
    assert_eq!(submissions[0].0, QueueInfo::new(0, 1).id());
    assert!(submissions[0]
        .1
        .waits
        .iter()
        .any(|wait| wait.value == transferred.value()));
    assert!(image_barriers(&mock)
        .iter()
        .all(|barrier| !barrier.is_queue_transfer()));
}

#[test]
pub fn cross_family_transfer() {
    let (mock, driver) = setup();
    let graphics = ExecutionQueue::new(&driver, QueueInfo::new(0, 0)).unwrap();
    let transfer = ExecutionQueue::new(&driver, QueueInfo::new(1, 0)).unwrap();
    let buffer = Arc::new(
        Buffer::create(
            &driver,
            BufferInfo::new(1024, vk::BufferUsageFlags::STORAGE_BUFFER),
        )
        .unwrap(),
    );

    let mut recorder = graphics.start_commands().unwrap();
    recorder.buffer_access(
        &buffer,
        MemoryAccess::shader_read_write(vk::PipelineStageFlags2::COMPUTE_SHADER),
    );
    graphics.submit_commands(recorder);
    mock.clear_calls();

    ExecutionQueue::ownership_transfer(&graphics, &transfer, &buffer).unwrap();

    let barriers = mock
        .barriers()
        .into_iter()
        .flat_map(|dependency| dependency.buffer_barriers)
        .collect::<Vec<_>>();
    let submissions = mock.submissions();

    assert_eq!(barriers.len(), 2);
    assert!(barriers.iter().all(|barrier| barrier.is_queue_transfer()));
    assert_eq!(submissions.len(), 2);
    assert_eq!(submissions[0].0.family_index, 0);
    assert_eq!(submissions[1].0.family_index, 1);
    assert_eq!(submissions[1].1.waits[0].value, submissions[0].1.signal_value);
}

#[test]
pub fn cross_queue_wait() {
    let (mock, driver) = setup();
    let a = ExecutionQueue::new(&driver, QueueInfo::new(0, 0)).unwrap();
    let b = ExecutionQueue::new(&driver, QueueInfo::new(0, 1)).unwrap();

    let sync_point = a.create_sync_point();

    b.wait_for(&sync_point);
    b.create_sync_point();

    let submissions = mock.submissions();
    let waits = &submissions[1].1.waits;

    assert_eq!(waits.len(), 1);
    assert_eq!(waits[0].value, sync_point.value());

    // Waits are consumed by the submission which carries them
    b.create_sync_point();

    assert!(mock.submissions()[2].1.waits.is_empty());
}
