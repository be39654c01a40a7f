/*
  Copyright© 2023 Raúl Wolters(1)

  This file is part of rustronomy-fuzzcon.

  rustronomy is free software: you can redistribute it and/or modify it under
  the terms of the European Union Public License version 1.2 or later, as
  published by the European Commission.

  rustronomy is distributed in the hope that it will be useful, but WITHOUT ANY
  WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR
  A PARTICULAR PURPOSE. See the European Union Public License for more details.

  You should have received a copy of the EUPL in an/all official language(s) of
  the European Union along with rustronomy.  If not, see
  <https://ec.europa.eu/info/european-union-public-licence_en/>.

  (1) Resident of the Kingdom of the Netherlands; agreement between licensor and
  licensee subject to Dutch law as per article 15 of the EUPL.
*/

#![doc(
  html_logo_url = "https://raw.githubusercontent.com/smups/rustronomy/main/logos/Rustronomy_ferris.png?raw=true"
)]
//! Rustronomy-fuzzcon is a pure-rust implementation of the fuzzy connectedness
//! region-growing segmentation algorithm (see Udupa & Samarasekera, 1996[^1]).
//!
//! # Algorithm
//! Fuzzy connectedness segments an object out of a grayscale image by growing
//! a region from user-supplied seed pixels. An *affinity* is defined between
//! neighbouring pixels, reflecting how likely the two are to belong to the
//! same object. A *path* between two pixels is a chain of neighbouring pixels
//! connecting them; the strength of a path is the weakest affinity along it.
//! The *fuzzy connectedness* of a pixel is the strongest path strength between
//! that pixel and any seed. Computing this strength for every pixel yields the
//! *fuzzy scene*, which is thresholded to obtain the binary segmented object.
//!
//! Because the scene is cached, the threshold can be changed as often as
//! desired without growing the region again. The expensive propagation runs
//! once per (image, seeds, affinity) combination; everything downstream of it
//! is cheap.
//!
//! # Quickstart
//! To use the latest release of Rustronomy-fuzzcon in a cargo project, add
//! the rustronomy-fuzzcon crate as a dependency to your `Cargo.toml` file:
//! ```toml
//! [dependencies]
//! rustronomy-fuzzcon = "0.1.0"
//! ```
//!
//! ## Short example: segmenting a bright square
//! `rustronomy-fuzzcon` uses the commonly used "builder pattern" to configure
//! the segmenter before executing it. To configure a segmenter, create an
//! instance of the `SegmenterBuilder` struct. Once you are done specifying
//! options for the builder struct using its associated functions, call the
//! `build()` function to generate a (`Sync`&`Send`) segmenter object.
//! ```rust
//! use rustronomy_fuzzcon::prelude::*;
//! use ndarray as nd;
//!
//! //Synthetic image: dark background with a bright square in the middle
//! let mut img = nd::Array2::<f64>::zeros((64, 64));
//! img.slice_mut(nd::s![24..40, 24..40]).fill(100.0);
//!
//! //Set-up the segmenter with object and difference statistics
//! let segmenter = SegmenterBuilder::new()
//!   .set_parameters(100.0, 25.0, 0.0, 25.0, 1.0)
//!   .build()
//!   .unwrap();
//!
//! //Grow the fuzzy scene from a seed inside the object
//! let mut seg = segmenter.segment(img.view(), &[(32, 32)]).unwrap();
//!
//! //Threshold the cached scene (cheap, repeatable)
//! seg.set_threshold(MAX_STRENGTH / 2);
//! assert_eq!(seg.mask()[(32, 32)], OBJECT);
//! ```
//! [^1]: J. Udupa and S. Samarasekera. **Fuzzy Connectedness and Object
//! Definition: Theory, Algorithms, and Applications in Image Segmentation.**
//! *Graphical Models and Image Processing*, Vol.58, No.3. pp 246-261, 1996.
//!
//! # Cargo feature gates
//! *By default, all features behind cargo feature gates are **disabled***
//! - `jemalloc`: this feature enables the [jemalloc allocator](https://jemalloc.net).
//! From the jemalloc website: *"jemalloc is a general purpose `malloc`(3)
//! implementation that emphasizes fragmentation avoidance and scalable concurrency
//! support."*. Jemalloc is enabled though usage of the `jemalloc` crate, which
//! increases compile times considerably. However, enabling this feature can also
//! greatly improve run-time performance, especially on machines with more (>6 or so)
//! cores. To compile `rustronomy-fuzzcon` with the `jemalloc` feature,
//! jemalloc must be installed on the host system.
//! - `plots`: with this feature enabled, `rustronomy-fuzzcon` can dump the
//! fuzzy scene and the binary mask as png images. Plotting support adds the
//! `plotters` crate as a dependency, which increases compile times and requires
//! the installation of some packages on linux systems,
//! [see the `plotters` documentation for details](https://docs.rs/plotters/).
//! - `progress`: this feature enables progress bars for the propagation run.
//! Enabling this feature adds the `indicatif` crate as a dependency,
//! which should not considerably slow down compile times.
//! - `debug`: this feature enables debug and performance monitoring output. This
//! can negatively impact performance. Enabling this feature does not add additional
//! dependencies.

//Unconditional imports
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicUsize, Ordering};

use ndarray as nd;
use num_traits::{Num, ToPrimitive};
use rayon::prelude::*;

//Set Jemalloc as the global allocator for this crate
#[cfg(feature = "jemalloc")]
#[global_allocator]
static GLOBAL: jemallocator::Jemalloc = jemallocator::Jemalloc;

//Progress bar (conditional)
#[cfg(feature = "progress")]
use indicatif;

//Maximum representable connectedness strength. Seeds are pinned at this value.
pub const MAX_STRENGTH: u16 = u16::MAX;
//Mask values for the thresholded output
pub const OBJECT: u8 = 1;
pub const BACKGROUND: u8 = 0;

//Utility prelude for batch import
pub mod prelude {
  pub use crate::{
    Affinity, AffinityParams, Connectivity, FuzzySegmenter, GaussianAffinity, RunningStats,
    SegmentError, Segmentation, SegmenterBuilder, SegmenterUtils, BACKGROUND, MAX_STRENGTH, OBJECT,
  };
}

////////////////////////////////////////////////////////////////////////////////
//                              HELPER FUNCTIONS                              //
////////////////////////////////////////////////////////////////////////////////

#[cfg(feature = "progress")]
fn set_up_bar(n_cells: usize) -> indicatif::ProgressBar {
  const TEMPLATE: &str = "{spinner}[{elapsed}/{duration}] settled {pos}/{len}{bar:60}";
  let style = indicatif::ProgressStyle::with_template(TEMPLATE);
  let bar = indicatif::ProgressBar::new(n_cells as u64);
  bar.set_style(style.unwrap());
  return bar;
}

#[inline]
fn neighbours_8con(index: &(usize, usize), shape: (usize, usize)) -> Vec<(usize, usize)> {
  let (x, y): (isize, isize) = (index.0 as isize, index.1 as isize);
  [
    (x + 1, y),
    (x + 1, y + 1),
    (x + 1, y - 1),
    (x, y + 1),
    (x, y - 1),
    (x - 1, y),
    (x - 1, y + 1),
    (x - 1, y - 1),
  ]
  .iter()
  .filter_map(|&(x, y)| {
    if x < 0 || y < 0 || x >= shape.0 as isize || y >= shape.1 as isize {
      None
    } else {
      Some((x as usize, y as usize))
    }
  })
  .collect()
}

#[inline]
fn neighbours_4con(index: &(usize, usize), shape: (usize, usize)) -> Vec<(usize, usize)> {
  let (x, y): (isize, isize) = (index.0 as isize, index.1 as isize);
  [(x + 1, y), (x, y + 1), (x, y - 1), (x - 1, y)]
    .iter()
    .filter_map(|&(x, y)| {
      if x < 0 || y < 0 || x >= shape.0 as isize || y >= shape.1 as isize {
        None
      } else {
        Some((x as usize, y as usize))
      }
    })
    .collect()
}

//Configuration checks shared by segmentation and parameter estimation
fn check_config(shape: (usize, usize), seeds: &[(usize, usize)]) -> Result<(), SegmentError> {
  if shape.0 == 0 || shape.1 == 0 {
    return Err(SegmentError::EmptyGrid);
  }
  if seeds.is_empty() {
    return Err(SegmentError::EmptySeeds);
  }
  for &seed in seeds {
    if seed.0 >= shape.0 || seed.1 >= shape.1 {
      return Err(SegmentError::SeedOutOfBounds { seed, shape });
    }
  }
  Ok(())
}

#[inline(always)]
fn gauss(dev: f64, var: f64) -> f64 {
  if var == 0.0 {
    //zero variance: exact-match step kernel, no division
    if dev == 0.0 {
      1.0
    } else {
      0.0
    }
  } else {
    (-0.5 * dev * dev / var).exp()
  }
}

#[inline(always)]
fn quantize(score: f64) -> u16 {
  //NaN scores end up at 0 (float->int casts are saturating, NaN -> 0)
  (score.clamp(0.0, 1.0) * f64::from(MAX_STRENGTH)).round() as u16
}

////////////////////////////////////////////////////////////////////////////////
//                             OPTIONAL MODULES                               //
////////////////////////////////////////////////////////////////////////////////
#[cfg(feature = "debug")]
mod performance_monitoring {

  #[derive(Clone, Debug, Default)]
  pub struct PerfReport {
    pub settled: usize,
    pub pushes: usize,
    pub stale_pops: usize,
    pub peak_queue: usize,
    pub total_ms: usize,
  }

  impl PerfReport {
    pub fn stale_fraction(&self) -> f64 {
      let pops = (self.settled + self.stale_pops) as f64;
      if pops == 0.0 {
        0.0
      } else {
        self.stale_pops as f64 / pops
      }
    }
  }

  impl std::fmt::Display for PerfReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      writeln!(f, ">---------[Performance Summary]---------")?;
      writeln!(f, ">  Settled {} pixels in {}ms", self.settled, self.total_ms)?;
      writeln!(
        f,
        ">  Queue: {} pushes; {} stale pops ({:.1}%); peak size {}",
        self.pushes,
        self.stale_pops,
        100.0 * self.stale_fraction(),
        self.peak_queue
      )?;
      writeln!(f, ">---------------------------------------")
    }
  }
}

#[cfg(feature = "plots")]
/// This module contains the code required to dump fuzzy scenes and binary
/// masks as grey-scale png images.
pub mod plotting {
  use ndarray as nd;
  use plotters::prelude::*;
  use std::{error::Error, path::Path};

  fn plot_grey(
    slice: nd::ArrayView2<f64>,
    file_name: &Path,
    max: f64,
  ) -> Result<(), Box<dyn Error>> {
    //Get the size of the slice
    let x_size = slice.shape()[0] as u32;
    let y_size = slice.shape()[1] as u32;

    //Make new fig
    let root = BitMapBackend::new(file_name, (x_size, y_size)).into_drawing_area();
    root.fill(&WHITE)?;

    //make empty drawing area in fig
    let mut chart = ChartBuilder::on(&root).build_cartesian_2d(0..x_size, 0..y_size)?;
    chart.configure_mesh().disable_mesh().disable_axes().draw()?;
    let plotting_area = chart.plotting_area();

    //fill pixels
    for ((x, y), &px) in slice.indexed_iter() {
      let grey = (255.0 * px / max) as u8;
      plotting_area.draw_pixel((x as u32, y as u32), &RGBColor(grey, grey, grey))?
    }

    //save file
    root.present()?;

    #[cfg(feature = "debug")]
    println!("slice saved as png: {file_name:?}");
    Ok(())
  }

  /// Dumps a fuzzy scene as a grey-scale png, full strength mapping to white.
  pub fn plot_scene(scene: nd::ArrayView2<u16>, file_name: &Path) -> Result<(), Box<dyn Error>> {
    plot_grey(scene.mapv(f64::from).view(), file_name, f64::from(crate::MAX_STRENGTH))
  }

  /// Dumps a binary mask as a black-and-white png, object pixels in white.
  pub fn plot_mask(mask: nd::ArrayView2<u8>, file_name: &Path) -> Result<(), Box<dyn Error>> {
    plot_grey(mask.mapv(f64::from).view(), file_name, f64::from(crate::OBJECT))
  }
}

////////////////////////////////////////////////////////////////////////////////
//                                  ERRORS                                    //
////////////////////////////////////////////////////////////////////////////////

/// Configuration errors reported before a propagation run starts. A failed
/// run leaves no partial fuzzy scene behind: `segment` either completes fully
/// or returns one of these.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SegmentError {
  #[error("input grid has zero extent")]
  EmptyGrid,
  #[error("no seed pixels were supplied")]
  EmptySeeds,
  #[error("seed {seed:?} lies outside the grid extent {shape:?}")]
  SeedOutOfBounds { seed: (usize, usize), shape: (usize, usize) },
  #[error("affinity parameter {name} is not finite (got {value})")]
  NonFiniteParameter { name: &'static str, value: f64 },
  #[error("no affinity parameters or affinity model were configured")]
  MissingAffinity,
}

////////////////////////////////////////////////////////////////////////////////
//                               AFFINITY MODEL                               //
////////////////////////////////////////////////////////////////////////////////

/// Statistics that parameterise the gaussian affinity model.
///
/// `mean`/`var` describe the intensity of the object of interest, while
/// `diff_mean`/`diff_var` describe the intensity *difference* between
/// neighbouring pixels inside the object. `weight` blends the two terms:
/// 1.0 scores pairs on their deviation from the object mean only, 0.0 on
/// their mutual difference only.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffinityParams {
  pub mean: f64,
  pub var: f64,
  pub diff_mean: f64,
  pub diff_var: f64,
  pub weight: f64,
}

impl AffinityParams {
  /// Checks that all five statistics are finite. Negative variances are not
  /// rejected: supplying one is a caller contract violation that yields an
  /// unspecified (but non-panicking) affinity.
  pub fn validate(&self) -> Result<(), SegmentError> {
    let fields = [
      ("mean", self.mean),
      ("var", self.var),
      ("diff_mean", self.diff_mean),
      ("diff_var", self.diff_var),
      ("weight", self.weight),
    ];
    for (name, value) in fields {
      if !value.is_finite() {
        return Err(SegmentError::NonFiniteParameter { name, value });
      }
    }
    Ok(())
  }
}

/// The affinity model scores the similarity of two neighbouring pixels on the
/// scale `0..=MAX_STRENGTH`. It is the one pluggable piece of the segmenter:
/// implement this trait to swap in an alternative affinity formula.
///
/// Implementations must be symmetric (`affinity(a, b) == affinity(b, a)`),
/// since path strengths do not depend on the direction a path is walked in.
pub trait Affinity {
  fn affinity(&self, a: f64, b: f64) -> u16;
}

/// The standard affinity formula: a gaussian score of the pair difference and
/// a gaussian score of the deviation of the pair average from the object
/// mean, blended with the configured weight.
#[derive(Debug, Clone)]
pub struct GaussianAffinity {
  params: AffinityParams,
}

impl GaussianAffinity {
  pub fn new(params: AffinityParams) -> Result<Self, SegmentError> {
    params.validate()?;
    Ok(GaussianAffinity { params })
  }

  pub fn params(&self) -> &AffinityParams {
    &self.params
  }
}

impl Affinity for GaussianAffinity {
  fn affinity(&self, a: f64, b: f64) -> u16 {
    let p = &self.params;
    let object = gauss(0.5 * (a + b) - p.mean, p.var);
    let score = if p.weight == 1.0 {
      object
    } else {
      let diff = gauss((a - b).abs() - p.diff_mean, p.diff_var);
      p.weight * object + (1.0 - p.weight) * diff
    };
    quantize(score)
  }
}

////////////////////////////////////////////////////////////////////////////////
//                            RUNNING STATISTICS                              //
////////////////////////////////////////////////////////////////////////////////

/// Single-pass mean/variance accumulator (Welford's update). Used to estimate
/// affinity parameters from sample regions, but useful on its own as well.
#[derive(Debug, Clone, Default)]
pub struct RunningStats {
  n: usize,
  mean: f64,
  m2: f64,
}

impl RunningStats {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn push(&mut self, sample: f64) {
    self.n += 1;
    let delta = sample - self.mean;
    self.mean += delta / self.n as f64;
    self.m2 += delta * (sample - self.mean);
  }

  pub fn len(&self) -> usize {
    self.n
  }

  pub fn is_empty(&self) -> bool {
    self.n == 0
  }

  /// Mean of the pushed samples, 0.0 if no samples were pushed.
  pub fn mean(&self) -> f64 {
    self.mean
  }

  /// Population variance of the pushed samples, 0.0 if no samples were pushed.
  pub fn variance(&self) -> f64 {
    if self.n == 0 {
      0.0
    } else {
      self.m2 / self.n as f64
    }
  }
}

////////////////////////////////////////////////////////////////////////////////
//                            FUZZY SEGMENTATION                              //
////////////////////////////////////////////////////////////////////////////////

/// Neighbourhood used when growing the region.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Connectivity {
  ///horizontal/vertical neighbours only
  #[default]
  Four,
  ///horizontal, vertical and diagonal neighbours
  Eight,
}

#[derive(Default)]
/// Builder for configuring a fuzzy connectedness segmenter.
///
/// Use `set_parameters` to configure the standard gaussian affinity model, or
/// `set_affinity` to supply a custom implementation of the `Affinity` trait.
/// Once you have set the desired options, a segmenter can be generated with
/// the `build()` associated function. `build` fails if no affinity was
/// configured, or if any of the supplied statistics is not finite.
pub struct SegmenterBuilder {
  affinity: Option<Box<dyn Affinity + Send + Sync>>,
  params: Option<AffinityParams>,
  connectivity: Connectivity,
}

impl SegmenterBuilder {
  pub fn new() -> Self {
    Self::default()
  }

  /// Sets the statistics of the standard gaussian affinity model: the
  /// estimated object mean and variance, the estimated mean and variance of
  /// the intensity difference between neighbouring object pixels, and the
  /// weight blending the two terms.
  pub fn set_parameters(
    mut self,
    mean: f64,
    var: f64,
    diff_mean: f64,
    diff_var: f64,
    weight: f64,
  ) -> Self {
    self.params = Some(AffinityParams { mean, var, diff_mean, diff_var, weight });
    self
  }

  /// Replaces the affinity model with a custom one. Takes precedence over
  /// `set_parameters`.
  pub fn set_affinity(mut self, affinity: Box<dyn Affinity + Send + Sync>) -> Self {
    self.affinity = Some(affinity);
    self
  }

  /// Selects the pixel neighbourhood (4-connected by default).
  pub fn set_connectivity(mut self, connectivity: Connectivity) -> Self {
    self.connectivity = connectivity;
    self
  }

  /// Build a `FuzzySegmenter` from the current builder configuration. This
  /// function returns an `Err` result if the builder was not properly
  /// configured.
  pub fn build(self) -> Result<FuzzySegmenter, SegmentError> {
    let affinity: Box<dyn Affinity + Send + Sync> = match (self.affinity, self.params) {
      (Some(model), _) => model,
      (None, Some(params)) => Box::new(GaussianAffinity::new(params)?),
      (None, None) => return Err(SegmentError::MissingAffinity),
    };
    Ok(FuzzySegmenter { affinity, connectivity: self.connectivity, runs: AtomicUsize::new(0) })
  }
}

/// A configured fuzzy connectedness segmenter.
///
/// `segment` grows the fuzzy scene from the supplied seeds and hands back a
/// `Segmentation` that owns the scene. The segmenter itself is stateless
/// apart from a diagnostic run counter, so one instance can segment many
/// images (also from multiple threads, it is `Sync`&`Send`).
pub struct FuzzySegmenter {
  affinity: Box<dyn Affinity + Send + Sync>,
  connectivity: Connectivity,
  runs: AtomicUsize,
}

impl std::fmt::Debug for FuzzySegmenter {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("FuzzySegmenter")
      .field("connectivity", &self.connectivity)
      .field("runs", &self.runs)
      .finish_non_exhaustive()
  }
}

impl FuzzySegmenter {
  /// Computes the fuzzy connectedness scene of `input` with respect to the
  /// given seed pixels and returns it as a `Segmentation`.
  ///
  /// Every seed receives the maximum strength `MAX_STRENGTH`; every other
  /// pixel receives the strength of the strongest path connecting it to a
  /// seed, where the strength of a path is the weakest affinity between the
  /// consecutive pixels that form it. Pixels that no positive-affinity path
  /// reaches keep strength 0.
  ///
  /// The propagation is a widest-path priority queue search: the pixel with
  /// the globally strongest pending candidate is settled first, so no pixel
  /// is ever settled below its optimum. Duplicate queue entries are used
  /// instead of a decrease-key operation; stale entries are discarded when
  /// popped. Tie order between equal-strength entries affects only the
  /// visitation order, never the resulting scene.
  ///
  /// Non-finite input samples (NaN, ±inf) score affinity 0 against every
  /// neighbour and thus end up outside the object. Use
  /// [`SegmenterUtils::pre_processor`] to map them to a chosen fill value
  /// instead.
  pub fn segment<T>(
    &self,
    input: nd::ArrayView2<T>,
    seeds: &[(usize, usize)],
  ) -> Result<Segmentation, SegmentError>
  where
    T: Num + Copy + ToPrimitive,
  {
    //(1) reject broken configurations before allocating anything
    let shape = (input.shape()[0], input.shape()[1]);
    check_config(shape, seeds)?;

    log::debug!(
      "growing fuzzy scene over {}x{} grid from {} seed(s)",
      shape.0,
      shape.1,
      seeds.len()
    );

    //(logging) make a new perfreport
    #[cfg(feature = "debug")]
    let mut perf = performance_monitoring::PerfReport::default();
    #[cfg(feature = "debug")]
    let run_start = std::time::Instant::now();

    //(2) make a float working copy of the grid for the affinity model
    let img = input.mapv(|px| px.to_f64().unwrap_or(f64::NAN));

    //(3) the scene starts all-zero with the seeds at full strength and queued
    let mut scene = nd::Array2::<u16>::zeros([shape.0, shape.1]);
    let mut settled = nd::Array2::<bool>::from_elem([shape.0, shape.1], false);
    let mut queue: BinaryHeap<(u16, (usize, usize))> = BinaryHeap::with_capacity(seeds.len());
    for &seed in seeds {
      scene[seed] = MAX_STRENGTH;
      queue.push((MAX_STRENGTH, seed));
    }

    let neighbours: fn(&(usize, usize), (usize, usize)) -> Vec<(usize, usize)> =
      match self.connectivity {
        Connectivity::Four => neighbours_4con,
        Connectivity::Eight => neighbours_8con,
      };

    //(4) set-up progress bar
    #[cfg(feature = "progress")]
    let bar = set_up_bar(shape.0 * shape.1);

    //(5) grow the region: always settle the strongest pending pixel first
    let mut pops = 0usize;
    let mut stale = 0usize;
    while let Some((strength, idx)) = queue.pop() {
      pops += 1;

      /*(i) Drop stale entries
        A pixel can be queued more than once: every improvement pushes a fresh
        entry rather than re-prioritising the old one. Whichever entry carries
        the pixel's best candidate pops first (the queue is a max-heap), so any
        pop of an already settled pixel is a leftover duplicate.
      */
      if settled[idx] {
        stale += 1;
        continue;
      }

      /*(ii) Settle the pixel
        The popped entry is the globally strongest pending candidate. Any path
        through a not-yet-settled pixel is capped by that pixel's own pending
        candidate, which is no stronger than this one. The popped strength is
        therefore this pixel's max-min optimum and is final.
      */
      debug_assert_eq!(scene[idx], strength);
      settled[idx] = true;
      scene[idx] = strength;

      #[cfg(feature = "progress")]
      bar.inc(1);

      //(iii) Relax the neighbours of the settled pixel
      for n in neighbours(&idx, shape) {
        if settled[n] {
          continue;
        }
        let candidate = strength.min(self.affinity.affinity(img[idx], img[n]));
        if candidate > scene[n] {
          scene[n] = candidate;
          queue.push((candidate, n));
          #[cfg(feature = "debug")]
          {
            perf.pushes += 1;
            perf.peak_queue = perf.peak_queue.max(queue.len());
          }
        }
      }
    }

    //(6) every reachable pixel is settled; unreachable pixels keep strength 0
    self.runs.fetch_add(1, Ordering::Relaxed);
    log::debug!("fuzzy scene complete: {} pops ({} stale)", pops, stale);

    //(7) print performance report
    #[cfg(all(feature = "debug", feature = "progress"))]
    {
      //In this combination we have a progress bar, we should use it to print
      perf.settled = pops - stale;
      perf.stale_pops = stale;
      perf.total_ms = run_start.elapsed().as_millis() as usize;
      bar.println(format!("{perf}"));
    }
    #[cfg(all(feature = "debug", not(feature = "progress")))]
    {
      //We do not have a progress bar, so a plain println! will have to do
      perf.settled = pops - stale;
      perf.stale_pops = stale;
      perf.total_ms = run_start.elapsed().as_millis() as usize;
      println!("{perf}");
    }

    Ok(Segmentation::new(scene, seeds.to_vec()))
  }

  /// Number of completed propagation runs. Re-thresholding a `Segmentation`
  /// never increments this counter.
  pub fn runs(&self) -> usize {
    self.runs.load(Ordering::Relaxed)
  }
}

/// This trait contains useful functions for preparing images and statistics
/// to be used as input for a fuzzy connectedness segmentation
pub trait SegmenterUtils {
  /// The `pre_processor` function converts an array of any numeric data-type
  /// `T` into an array of `f64`, replacing special float values (if `T` is a
  /// float type) with the given fill value. Without pre-processing, NaN and
  /// ±inf pixels score affinity 0 against all of their neighbours and end up
  /// disconnected from the object.
  fn pre_processor<T, D>(&self, img: nd::ArrayView<T, D>, fill: f64) -> nd::Array<f64, D>
  where
    T: Num + Copy + ToPrimitive,
    D: nd::Dimension,
  {
    img.mapv(|px| {
      let float = px.to_f64().unwrap_or(f64::NAN);
      if float.is_finite() {
        float
      } else {
        fill
      }
    })
  }

  /// Estimates affinity parameters by sampling square windows of half-width
  /// `radius` around the seed pixels: the object mean/variance from the
  /// sampled intensities and the difference mean/variance from the absolute
  /// intensity differences of 4-connected pairs inside the windows. The
  /// blending weight is passed through unchanged.
  ///
  /// The seeds must lie inside the grid; the sample windows are clipped to
  /// the grid extent. Non-finite samples are skipped.
  fn estimate_parameters<T>(
    &self,
    img: nd::ArrayView2<T>,
    seeds: &[(usize, usize)],
    radius: usize,
    weight: f64,
  ) -> Result<AffinityParams, SegmentError>
  where
    T: Num + Copy + ToPrimitive,
  {
    let shape = (img.shape()[0], img.shape()[1]);
    check_config(shape, seeds)?;

    let mut object = RunningStats::new();
    let mut diff = RunningStats::new();

    for &(sx, sy) in seeds {
      //clip the sample window to the grid extent
      let x0 = sx.saturating_sub(radius);
      let y0 = sy.saturating_sub(radius);
      let x1 = (sx + radius + 1).min(shape.0);
      let y1 = (sy + radius + 1).min(shape.1);
      let patch = img.slice(nd::s![x0..x1, y0..y1]);

      //object intensity samples
      for &px in patch.iter() {
        let float = px.to_f64().unwrap_or(f64::NAN);
        if float.is_finite() {
          object.push(float);
        }
      }

      //neighbour difference samples, along both axes
      for window in patch.windows([1, 2]) {
        if let (Some(a), Some(b)) = (window[[0, 0]].to_f64(), window[[0, 1]].to_f64()) {
          if a.is_finite() && b.is_finite() {
            diff.push((a - b).abs());
          }
        }
      }
      for window in patch.windows([2, 1]) {
        if let (Some(a), Some(b)) = (window[[0, 0]].to_f64(), window[[1, 0]].to_f64()) {
          if a.is_finite() && b.is_finite() {
            diff.push((a - b).abs());
          }
        }
      }
    }

    let params = AffinityParams {
      mean: object.mean(),
      var: object.variance(),
      diff_mean: diff.mean(),
      diff_var: diff.variance(),
      weight,
    };
    params.validate()?;
    Ok(params)
  }
}

impl SegmenterUtils for SegmenterBuilder {}
impl SegmenterUtils for FuzzySegmenter {}

////////////////////////////////////////////////////////////////////////////////
//                            THRESHOLDING STAGE                              //
////////////////////////////////////////////////////////////////////////////////

/// The result of a propagation run: the fuzzy scene plus the thresholded
/// binary mask derived from it.
///
/// The scene is computed once and never changes; only the threshold does.
/// `set_threshold` re-derives the mask from the cached scene, which is cheap
/// compared to the propagation itself. A `Segmentation` holds no reference to
/// the input image, so re-thresholding cannot re-run the propagation.
///
/// A fresh `Segmentation` starts at threshold `MAX_STRENGTH`: only the seeds
/// and pixels connected to them at full strength count as object until the
/// caller lowers the cut.
#[derive(Debug)]
pub struct Segmentation {
  scene: nd::Array2<u16>,
  seeds: Vec<(usize, usize)>,
  threshold: u16,
  mask: nd::Array2<u8>,
}

impl Segmentation {
  fn new(scene: nd::Array2<u16>, seeds: Vec<(usize, usize)>) -> Self {
    let mask = nd::Array2::from_elem(scene.raw_dim(), BACKGROUND);
    let mut out = Segmentation { scene, seeds, threshold: MAX_STRENGTH, mask };
    out.remask();
    out
  }

  //Parallel re-derivation of the mask from the cached scene
  fn remask(&mut self) {
    let cut = self.threshold;
    nd::Zip::from(&mut self.mask).and(&self.scene).into_par_iter().for_each(|(m, &s)| {
      *m = if s >= cut { OBJECT } else { BACKGROUND };
    });
  }

  /// Changes the threshold and re-derives the binary mask from the cached
  /// scene. The propagation run is *not* repeated.
  ///
  /// Seed pixels hold `MAX_STRENGTH` in the scene, so they are classified as
  /// object under every representable threshold. A threshold of 0 yields an
  /// all-object mask.
  pub fn set_threshold(&mut self, threshold: u16) {
    self.threshold = threshold;
    self.remask();
  }

  /// The fuzzy connectedness scene: one strength per pixel.
  pub fn scene(&self) -> nd::ArrayView2<u16> {
    self.scene.view()
  }

  /// The binary mask under the current threshold (`OBJECT`/`BACKGROUND`).
  pub fn mask(&self) -> nd::ArrayView2<u8> {
    self.mask.view()
  }

  pub fn threshold(&self) -> u16 {
    self.threshold
  }

  pub fn seeds(&self) -> &[(usize, usize)] {
    &self.seeds
  }

  /// Number of object pixels under the current threshold.
  pub fn object_size(&self) -> usize {
    self.mask.iter().filter(|&&m| m == OBJECT).count()
  }

  /// Coarse histogram of the scene strengths, useful for picking a threshold.
  /// Strength `s` lands in bin `s * bins / (MAX_STRENGTH + 1)`.
  pub fn strength_histogram(&self, bins: usize) -> Vec<usize> {
    let mut hist = vec![0usize; bins];
    if bins == 0 {
      return hist;
    }
    for &s in self.scene.iter() {
      hist[(s as usize * bins) / (MAX_STRENGTH as usize + 1)] += 1;
    }
    hist
  }

  /// Consumes the segmentation, yielding the scene array.
  pub fn into_scene(self) -> nd::Array2<u16> {
    self.scene
  }
}
