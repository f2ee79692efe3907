//! A client exposing a pretend temperature sensor (IPSO object 3303).
//!
//! ```text
//! cargo run --example client -- coap://192.0.2.1:5683 my-endpoint
//! ```
//!
//! Observe `/3303/0/5700` from your server and watch the temperature
//! wander.

use std::time::{Duration, Instant};

use toad_lwm2m::registry::{Field, Object, Perm};
use toad_lwm2m::{obj, platform, Config, Engine, Path, ResourceKind};

fn main() {
  simple_logger::SimpleLogger::new().init().unwrap();

  let mut args = std::env::args().skip(1);
  let uri = args.next()
                .unwrap_or_else(|| "coap://127.0.0.1:5683".to_string());
  let endpoint = args.next().unwrap_or_else(|| "toad-lwm2m-demo".to_string());

  let mut engine: Engine<platform::Std> = Engine::new(Config::default());
  obj::register_core_objects(engine.registry_mut()).unwrap();
  engine.registry_mut()
        .set_string(&Path::resource(0, 0, 0), &uri)
        .unwrap();
  engine.registry_mut()
        .set_u16(&Path::resource(0, 0, 10), 101)
        .unwrap();
  engine.registry_mut()
        .set_u16(&Path::resource(1, 0, 0), 101)
        .unwrap();

  let temperature = Path::resource(3303, 0, 5700);
  engine.registry_mut()
        .register_object(Object::new(3303,
                                     (1, 0),
                                     vec![Field::new(5700, ResourceKind::Float, Perm::R),
                                          Field::new(5701, ResourceKind::String, Perm::R)
                                            .capacity(8)],
                                     1))
        .unwrap();
  engine.registry_mut().create_instance(3303, 0).unwrap();
  engine.registry_mut()
        .set_string(&Path::resource(3303, 0, 5701), "Cel")
        .unwrap();

  engine.start(&endpoint, false).unwrap();

  let started = Instant::now();
  let mut last_sample = Instant::now();
  loop {
    engine.step().unwrap();

    while let Some(notice) = engine.poll_notice() {
      log::info!("notice: {:?}", notice);
    }

    if last_sample.elapsed() >= Duration::from_secs(5) {
      last_sample = Instant::now();
      let wobble = (started.elapsed().as_secs() % 40) as f64 / 10.0;
      engine.registry_mut()
            .set_float(&temperature, 19.0 + wobble)
            .unwrap();
    }

    std::thread::sleep(Duration::from_millis(engine.next_event_in_ms().min(50).max(1)));
  }
}
